use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let key = self
            .booking_index
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let ledger = self.get_day_ledger(&key).ok_or(EngineError::NotFound(id))?;
        let guard = self.within_timeout("day read", ledger.read()).await?;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every booking for a provider on a date, terminal ones included, ordered by serial.
    pub async fn list_day_bookings(
        &self,
        provider: &ProviderKey,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        let key = DayKey::new(provider.clone(), date);
        let Some(ledger) = self.get_day_ledger(&key) else {
            return Ok(Vec::new());
        };
        let guard = self.within_timeout("day read", ledger.read()).await?;
        let mut bookings = guard.bookings.clone();
        bookings.sort_by_key(|b| (b.serial, b.created_at));
        Ok(bookings)
    }

    /// All configs, optionally narrowed to one provider.
    pub async fn list_configs(
        &self,
        provider: Option<&ProviderKey>,
    ) -> Result<Vec<ProviderSerialConfig>, EngineError> {
        let states: Vec<_> = self.configs.iter().map(|e| e.value().clone()).collect();
        let mut configs = Vec::with_capacity(states.len());
        for state in states {
            let guard = self.within_timeout("config read", state.read()).await?;
            if provider.is_none_or(|p| *p == guard.config.provider) {
                configs.push(guard.config.clone());
            }
        }
        configs.sort_by_key(|c| c.id);
        Ok(configs)
    }

    pub async fn get_config(&self, id: Ulid) -> Result<ProviderSerialConfig, EngineError> {
        let state = self.get_config_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = self.within_timeout("config read", state.read()).await?;
        Ok(guard.config.clone())
    }

    pub async fn active_config_for(
        &self,
        provider: &ProviderKey,
    ) -> Result<Option<ProviderSerialConfig>, EngineError> {
        match self.active_config_id(provider) {
            Some(id) => self.get_config(id).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_override(
        &self,
        config_id: Ulid,
        date: NaiveDate,
    ) -> Result<Option<DateOverride>, EngineError> {
        let state = self
            .get_config_state(&config_id)
            .ok_or(EngineError::NotFound(config_id))?;
        let guard = self.within_timeout("config read", state.read()).await?;
        Ok(guard.overrides.get(&date).cloned())
    }

    /// Overrides for a config in date order.
    pub async fn list_overrides(&self, config_id: Ulid) -> Result<Vec<DateOverride>, EngineError> {
        let state = self
            .get_config_state(&config_id)
            .ok_or(EngineError::NotFound(config_id))?;
        let guard = self.within_timeout("config read", state.read()).await?;
        Ok(guard.overrides.values().cloned().collect())
    }
}
