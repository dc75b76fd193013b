use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::allocator::{check_self_service_serial, check_staff_serial};
use super::settings::ensure_bookable;
use super::{Engine, EngineError, now_ms};

/// A request for one serial on one date.
///
/// The id is fixed when the request is built, so a retried commit carries the
/// same id and a duplicate WAL record collapses on replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub provider: ProviderKey,
    pub date: NaiveDate,
    pub serial: u32,
    pub patient_id: String,
    /// Defaults to the serial's slice of the effective window.
    pub requested_window: Option<TimeWindow>,
}

impl BookingRequest {
    pub fn new(provider: ProviderKey, date: NaiveDate, serial: u32, patient_id: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            provider,
            date,
            serial,
            patient_id: patient_id.into(),
            requested_window: None,
        }
    }

    pub fn with_id(mut self, id: Ulid) -> Self {
        self.id = id;
        self
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.requested_window = Some(window);
        self
    }
}

impl Engine {
    /// Book an even serial for a patient.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        self.book(req, BookingSource::SelfService).await
    }

    /// Assign an odd serial to a walk-in. Same uniqueness check as self-service.
    pub async fn assign_walk_in(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        self.book(req, BookingSource::Staff).await
    }

    async fn book(&self, req: BookingRequest, source: BookingSource) -> Result<Booking, EngineError> {
        let result = self
            .with_retry("create booking", || self.commit_booking(&req, source))
            .await;

        let outcome = match &result {
            Ok(_) => "created",
            Err(EngineError::SerialAlreadyBooked(_)) => "conflict",
            Err(e) if e.is_transient() => "transient",
            Err(_) => "rejected",
        };
        metrics::counter!(
            observability::BOOKINGS_TOTAL,
            "source" => source.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        result
    }

    /// The check-and-insert. Everything between `lock_day` and the WAL append
    /// runs with the day ledger held exclusively.
    async fn commit_booking(
        &self,
        req: &BookingRequest,
        source: BookingSource,
    ) -> Result<Booking, EngineError> {
        if req.patient_id.is_empty() {
            return Err(EngineError::InvalidConfig("patient id must not be empty".into()));
        }
        if req.patient_id.len() > MAX_ID_LEN {
            return Err(EngineError::LimitExceeded("patient id too long"));
        }

        let key = DayKey::new(req.provider.clone(), req.date);
        if let Some(existing_day) = self.booking_index.get(&req.id)
            && *existing_day.value() != key
        {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let _gate = self.enter_write().await?;
        let mut ledger = self.lock_day(&key).await?;

        if let Some(existing) = ledger.get(&req.id) {
            // An earlier attempt with this id already committed.
            if existing.serial == req.serial && existing.patient_id == req.patient_id {
                debug!("booking {} already committed, returning it", req.id);
                return Ok(existing.clone());
            }
            return Err(EngineError::AlreadyExists(req.id));
        }
        if ledger.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings for this date"));
        }

        // Resolved under the day lock: the booking is judged against the
        // config as it stands at commit time.
        let settings = self.resolve_settings(&req.provider, req.date).await?;
        ensure_bookable(&settings)?;
        match source {
            BookingSource::SelfService => check_self_service_serial(&settings, req.serial)?,
            BookingSource::Staff => check_staff_serial(&settings, req.serial)?,
        }

        if let Some(holder) = ledger.holder_of(req.serial) {
            debug!("serial {} on {key} held by {holder}", req.serial);
            metrics::counter!(observability::SERIAL_CONFLICTS_TOTAL, "source" => source.as_str())
                .increment(1);
            return Err(EngineError::SerialAlreadyBooked(req.serial));
        }

        let time_slot = match req.requested_window {
            Some(w) if !w.is_valid() || !settings.window.contains(&w) => {
                return Err(EngineError::InvalidTimeWindow(w));
            }
            Some(w) => w,
            None => settings.window.slice(req.serial, settings.total_slots),
        };

        let now = now_ms();
        let booking = Booking {
            id: req.id,
            provider: req.provider.clone(),
            date: req.date,
            serial: req.serial,
            patient_id: req.patient_id.clone(),
            status: BookingStatus::Pending,
            source,
            time_slot,
            fee: settings.price,
            cancelled_by: None,
            cancelled_at: None,
            reason: None,
            created_at: now,
            updated_at: now,
        };

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_day_event(&mut ledger, &event).await?;
        info!(
            "booking {} created: {key} serial {} ({}) for {}",
            booking.id,
            booking.serial,
            source.as_str(),
            booking.patient_id
        );
        Ok(booking)
    }
}
