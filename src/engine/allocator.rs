use chrono::NaiveDate;

use crate::model::*;

use super::{Engine, EngineError};

/// Even serials `2, 4, …, 2·floor(total/2)`. Odd serials never appear.
pub fn self_service_candidates(total_slots: u32) -> impl Iterator<Item = u32> {
    (1..=total_slots / 2).map(|n| n * 2)
}

/// Open self-service serials for one provider on one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialAvailability {
    pub settings: EffectiveSettings,
    /// Ascending. Empty when the date is closed.
    pub serials: Vec<u32>,
}

impl SerialAvailability {
    pub fn closure(&self) -> Option<ClosureReason> {
        self.settings.closure
    }
}

/// Range then parity: anything outside `[2, 2·evenCeiling]` is out of range
/// even when odd.
pub(crate) fn check_self_service_serial(
    settings: &EffectiveSettings,
    serial: u32,
) -> Result<(), EngineError> {
    let max = settings.max_self_service_serial();
    if serial < 2 || serial > max {
        return Err(EngineError::SerialOutOfRange { serial, min: 2, max });
    }
    if serial % 2 == 1 {
        return Err(EngineError::SerialMustBeEven(serial));
    }
    Ok(())
}

/// Staff walk-ins take odd serials up to the day's capacity.
pub(crate) fn check_staff_serial(settings: &EffectiveSettings, serial: u32) -> Result<(), EngineError> {
    if serial < 1 || serial > settings.total_slots {
        return Err(EngineError::SerialOutOfRange {
            serial,
            min: 1,
            max: settings.total_slots,
        });
    }
    if serial % 2 == 0 {
        return Err(EngineError::SerialMustBeOdd(serial));
    }
    Ok(())
}

impl Engine {
    /// Even serials not held on `date`. A snapshot; the booking commit
    /// re-checks under the day lock.
    pub async fn available_serials(
        &self,
        provider: &ProviderKey,
        date: NaiveDate,
    ) -> Result<SerialAvailability, EngineError> {
        let settings = self.resolve_settings(provider, date).await?;
        if !settings.is_bookable() {
            return Ok(SerialAvailability {
                settings,
                serials: Vec::new(),
            });
        }

        let key = DayKey::new(provider.clone(), date);
        let serials = match self.get_day_ledger(&key) {
            Some(ledger) => {
                let guard = self.within_timeout("day read", ledger.read()).await?;
                self_service_candidates(settings.total_slots)
                    .filter(|s| guard.holder_of(*s).is_none())
                    .collect()
            }
            None => self_service_candidates(settings.total_slots).collect(),
        };
        Ok(SerialAvailability { settings, serials })
    }

    /// Advisory check of a self-service serial. Performs no writes.
    pub async fn validate_requested_serial(
        &self,
        provider: &ProviderKey,
        date: NaiveDate,
        serial: u32,
    ) -> Result<(), EngineError> {
        let settings = self.resolve_settings(provider, date).await?;
        super::settings::ensure_bookable(&settings)?;
        check_self_service_serial(&settings, serial)?;

        let key = DayKey::new(provider.clone(), date);
        if let Some(ledger) = self.get_day_ledger(&key) {
            let guard = self.within_timeout("day read", ledger.read()).await?;
            if guard.holder_of(serial).is_some() {
                return Err(EngineError::SerialAlreadyBooked(serial));
            }
        }
        Ok(())
    }
}
