use thiserror::Error;
use ulid::Ulid;

use crate::model::{Actor, BookingStatus, ClosureReason, TimeWindow};

/// Coarse error families. Callers branch on these; the variant carries detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Availability,
    State,
    Transient,
    NotFound,
    Limit,
}

#[derive(Debug, Error)]
pub enum EngineError {
    // ── Configuration ───────────────────────────────────────
    #[error("no active serial config for provider {0}")]
    NotConfigured(String),

    #[error("invalid time window {0}: end must be after start and within the day")]
    InvalidTimeWindow(TimeWindow),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("provider {provider} already has active config {existing}")]
    AlreadyActive { provider: String, existing: Ulid },

    // ── Availability ────────────────────────────────────────
    #[error("booking closed: {0}")]
    BookingClosed(ClosureReason),

    #[error("serial {0} is already booked for this date, choose another serial")]
    SerialAlreadyBooked(u32),

    #[error("serial {serial} out of range, must be within [{min}, {max}]")]
    SerialOutOfRange { serial: u32, min: u32, max: u32 },

    #[error("serial {0} is reserved for staff, self-service serials must be even")]
    SerialMustBeEven(u32),

    #[error("serial {0} is a self-service serial, staff-assigned serials must be odd")]
    SerialMustBeOdd(u32),

    // ── State machine ───────────────────────────────────────
    #[error("invalid transition {from} -> {to} by {actor}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
        actor: Actor,
    },

    #[error("transition to {0} requires a reason")]
    ReasonRequired(BookingStatus),

    // ── Transient ───────────────────────────────────────────
    #[error("store timeout during {0}")]
    Timeout(&'static str),

    #[error("store write failed: {0}")]
    Store(String),

    // ── Other ───────────────────────────────────────────────
    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotConfigured(_)
            | EngineError::InvalidTimeWindow(_)
            | EngineError::InvalidConfig(_)
            | EngineError::AlreadyActive { .. } => ErrorKind::Configuration,
            EngineError::BookingClosed(_)
            | EngineError::SerialAlreadyBooked(_)
            | EngineError::SerialOutOfRange { .. }
            | EngineError::SerialMustBeEven(_)
            | EngineError::SerialMustBeOdd(_) => ErrorKind::Availability,
            EngineError::InvalidTransition { .. } | EngineError::ReasonRequired(_) => {
                ErrorKind::State
            }
            EngineError::Timeout(_) | EngineError::Store(_) => ErrorKind::Transient,
            EngineError::NotFound(_) | EngineError::AlreadyExists(_) => ErrorKind::NotFound,
            EngineError::LimitExceeded(_) => ErrorKind::Limit,
        }
    }

    /// Stable machine-readable code, surfaced to clients next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotConfigured(_) => "not_configured",
            EngineError::InvalidTimeWindow(_) => "invalid_time_window",
            EngineError::InvalidConfig(_) => "invalid_config",
            EngineError::AlreadyActive { .. } => "already_active",
            EngineError::BookingClosed(_) => "booking_closed",
            EngineError::SerialAlreadyBooked(_) => "serial_already_booked",
            EngineError::SerialOutOfRange { .. } => "serial_out_of_range",
            EngineError::SerialMustBeEven(_) => "serial_must_be_even",
            EngineError::SerialMustBeOdd(_) => "serial_must_be_odd",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::ReasonRequired(_) => "reason_required",
            EngineError::Timeout(_) => "timeout",
            EngineError::Store(_) => "store_failure",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EngineError::Timeout("day lock").is_transient());
        assert!(EngineError::Store("disk full".into()).is_transient());
        assert!(!EngineError::SerialAlreadyBooked(4).is_transient());
    }

    #[test]
    fn messages_are_actionable() {
        let e = EngineError::SerialAlreadyBooked(4);
        assert_eq!(e.kind(), ErrorKind::Availability);
        assert_eq!(e.code(), "serial_already_booked");
        assert!(e.to_string().contains("choose another serial"));

        let e = EngineError::SerialOutOfRange { serial: 21, min: 2, max: 20 };
        assert_eq!(e.to_string(), "serial 21 out of range, must be within [2, 20]");
    }
}
