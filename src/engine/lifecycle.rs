use serde_json::json;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, now_ms};

/// A requested status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub to: BookingStatus,
    pub actor: Actor,
    pub reason: Option<String>,
}

impl StatusChange {
    pub fn new(to: BookingStatus, actor: Actor) -> Self {
        Self {
            to,
            actor,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// What runs after a transition commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Effects {
    /// Event type sent to the patient.
    pub notify: Option<&'static str>,
    pub record_earnings: bool,
}

impl Effects {
    const NONE: Effects = Effects {
        notify: None,
        record_earnings: false,
    };

    fn notifying(event_type: &'static str) -> Self {
        Self {
            notify: Some(event_type),
            record_earnings: false,
        }
    }
}

/// The transition table. Anything not listed is `InvalidTransition`,
/// including a legal pair attempted by the wrong actor.
pub fn check_transition(
    from: BookingStatus,
    to: BookingStatus,
    actor: Actor,
    reason: Option<&str>,
) -> Result<Effects, EngineError> {
    use Actor::*;
    use BookingStatus::*;

    let effects = match (from, to, actor) {
        (Pending, Accepted, Provider) => Effects::notifying("booking_accepted"),
        (Pending, Rejected, Provider) => {
            if reason.is_none_or(|r| r.trim().is_empty()) {
                return Err(EngineError::ReasonRequired(Rejected));
            }
            Effects::notifying("booking_rejected")
        }
        (Pending, Cancelled, Patient) => Effects::NONE,
        (Accepted, Completed, Provider) => Effects {
            notify: Some("booking_completed"),
            record_earnings: true,
        },
        (Accepted, Cancelled, Patient | Provider) => Effects::notifying("booking_cancelled"),
        (Pending | Accepted, NoShow, Provider) => Effects::NONE,
        _ => return Err(EngineError::InvalidTransition { from, to, actor }),
    };
    Ok(effects)
}

impl Engine {
    /// Apply a transition. The status is durable before any side effect runs,
    /// and side-effect failures are logged without undoing it.
    pub async fn change_status(&self, id: Ulid, change: StatusChange) -> Result<Booking, EngineError> {
        if change.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }

        let (booking, effects) = self
            .with_retry("change status", || self.commit_status(id, &change))
            .await?;

        metrics::counter!(observability::STATUS_TRANSITIONS_TOTAL, "to" => change.to.as_str())
            .increment(1);
        self.dispatch_effects(&booking, effects).await;
        Ok(booking)
    }

    async fn commit_status(
        &self,
        id: Ulid,
        change: &StatusChange,
    ) -> Result<(Booking, Effects), EngineError> {
        let key = self
            .booking_index
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;

        let _gate = self.enter_write().await?;
        let mut ledger = self.lock_day(&key).await?;

        // Re-read under the lock; a concurrent transition may have won.
        let from = ledger.get(&id).ok_or(EngineError::NotFound(id))?.status;
        let effects = check_transition(from, change.to, change.actor, change.reason.as_deref())?;

        let event = Event::StatusChanged {
            id,
            day: key.clone(),
            change: AppliedStatus {
                status: change.to,
                actor: change.actor,
                reason: change.reason.clone(),
                at: now_ms(),
            },
        };
        self.persist_day_event(&mut ledger, &event).await?;
        let booking = ledger.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        info!("booking {id} {from} -> {} by {} ({key})", change.to, change.actor);
        Ok((booking, effects))
    }

    async fn dispatch_effects(&self, booking: &Booking, effects: Effects) {
        let collaborators = self.collaborators();

        if let Some(event_type) = effects.notify {
            let payload = json!({
                "booking_id": booking.id.to_string(),
                "provider": booking.provider.to_string(),
                "date": booking.date.to_string(),
                "serial": booking.serial,
                "status": booking.status.as_str(),
                "time_slot": booking.time_slot.to_string(),
                "reason": booking.reason,
            });
            if let Err(e) = collaborators
                .notifier
                .send(&booking.patient_id, event_type, payload)
                .await
            {
                warn!("notify {event_type} for booking {} failed: {e}", booking.id);
                metrics::counter!(observability::SIDE_EFFECT_FAILURES_TOTAL, "effect" => "notify")
                    .increment(1);
            }
        }

        if effects.record_earnings
            && let Err(e) = collaborators
                .earnings
                .record(&booking.provider, booking.id, booking.fee)
                .await
        {
            warn!("earnings for booking {} not recorded: {e}", booking.id);
            metrics::counter!(observability::SIDE_EFFECT_FAILURES_TOTAL, "effect" => "earnings")
                .increment(1);
        }
    }

    pub async fn accept(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.change_status(id, StatusChange::new(BookingStatus::Accepted, Actor::Provider))
            .await
    }

    pub async fn reject(&self, id: Ulid, reason: impl Into<String>) -> Result<Booking, EngineError> {
        self.change_status(
            id,
            StatusChange::new(BookingStatus::Rejected, Actor::Provider).with_reason(reason),
        )
        .await
    }

    pub async fn complete(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.change_status(id, StatusChange::new(BookingStatus::Completed, Actor::Provider))
            .await
    }

    pub async fn cancel(
        &self,
        id: Ulid,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let change = StatusChange {
            to: BookingStatus::Cancelled,
            actor,
            reason,
        };
        self.change_status(id, change).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.change_status(id, StatusChange::new(BookingStatus::NoShow, Actor::Provider))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    #[test]
    fn table_effects() {
        let e = check_transition(Pending, Accepted, Actor::Provider, None).unwrap();
        assert_eq!(e.notify, Some("booking_accepted"));
        assert!(!e.record_earnings);

        let e = check_transition(Accepted, Completed, Actor::Provider, None).unwrap();
        assert!(e.record_earnings);

        let e = check_transition(Pending, Cancelled, Actor::Patient, None).unwrap();
        assert_eq!(e, Effects::default());

        let e = check_transition(Accepted, Cancelled, Actor::Provider, None).unwrap();
        assert_eq!(e.notify, Some("booking_cancelled"));
    }

    #[test]
    fn wrong_actor_is_invalid() {
        assert!(matches!(
            check_transition(Pending, Accepted, Actor::Patient, None),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            check_transition(Pending, Cancelled, Actor::Provider, None),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            check_transition(Accepted, NoShow, Actor::Patient, None),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [Rejected, Completed, Cancelled, NoShow] {
            for to in [Pending, Accepted, Rejected, Completed, Cancelled, NoShow] {
                for actor in [Actor::Patient, Actor::Provider] {
                    assert!(
                        check_transition(from, to, actor, Some("x")).is_err(),
                        "{from} -> {to} by {actor} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn rejection_needs_reason() {
        assert!(matches!(
            check_transition(Pending, Rejected, Actor::Provider, None),
            Err(EngineError::ReasonRequired(Rejected))
        ));
        assert!(matches!(
            check_transition(Pending, Rejected, Actor::Provider, Some("  ")),
            Err(EngineError::ReasonRequired(Rejected))
        ));
        assert!(check_transition(Pending, Rejected, Actor::Provider, Some("doctor away")).is_ok());
    }
}
