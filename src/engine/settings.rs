use chrono::{Datelike, NaiveDate};

use crate::model::*;

use super::{Engine, EngineError};

/// Merge a base config with the override for `date`, if any.
///
/// A disabled override closes the date no matter what else it sets. An
/// enabled override replaces each field it carries and also opens a weekday
/// the base config does not serve.
pub fn merge_settings(
    config: &ProviderSerialConfig,
    date: NaiveDate,
    date_override: Option<&DateOverride>,
) -> Result<EffectiveSettings, EngineError> {
    if !config.window.is_valid() {
        return Err(EngineError::InvalidTimeWindow(config.window));
    }

    let mut settings = EffectiveSettings {
        config_id: config.id,
        provider: config.provider.clone(),
        date,
        total_slots: config.total_slots,
        window: config.window,
        price: config.price,
        admin_note: None,
        closure: None,
    };

    match date_override {
        Some(o) if !o.enabled => {
            settings.admin_note = o.admin_note.clone();
            settings.closure = Some(ClosureReason::OverrideDisabled);
        }
        Some(o) => {
            if let Some(window) = o.window {
                if !window.is_valid() {
                    return Err(EngineError::InvalidTimeWindow(window));
                }
                settings.window = window;
            }
            if let Some(total) = o.total_slots {
                settings.total_slots = total;
            }
            if let Some(price) = o.price {
                settings.price = price;
            }
            settings.admin_note = o.admin_note.clone();
        }
        None => {
            let weekday = date.weekday();
            if !config.available_days.contains(weekday) {
                settings.closure = Some(ClosureReason::NotAvailableOnWeekday(weekday));
            }
        }
    }

    Ok(settings)
}

/// Turn a closed date into `BookingClosed`.
pub(crate) fn ensure_bookable(settings: &EffectiveSettings) -> Result<(), EngineError> {
    match settings.closure {
        Some(reason) => Err(EngineError::BookingClosed(reason)),
        None => Ok(()),
    }
}

/// Hospital doctors and diagnostic tests must name their organization;
/// individual doctors must not.
pub(crate) fn validate_provider(provider: &ProviderKey) -> Result<(), EngineError> {
    if provider.id.is_empty() {
        return Err(EngineError::InvalidConfig("provider id must not be empty".into()));
    }
    match (provider.kind.requires_parent(), &provider.parent_org_id) {
        (true, None) => Err(EngineError::InvalidConfig(format!(
            "{} requires a parent organization",
            provider.kind
        ))),
        (false, Some(_)) => Err(EngineError::InvalidConfig(format!(
            "{} cannot have a parent organization",
            provider.kind
        ))),
        _ => Ok(()),
    }
}

impl Engine {
    /// Effective settings for a provider on one calendar day.
    ///
    /// A closed date is not an error here; the closure is reported in
    /// `EffectiveSettings::closure`. Booking paths turn it into
    /// `BookingClosed` via `ensure_bookable`.
    pub async fn resolve_settings(
        &self,
        provider: &ProviderKey,
        date: NaiveDate,
    ) -> Result<EffectiveSettings, EngineError> {
        validate_provider(provider)?;
        let config_id = self
            .active_config_id(provider)
            .ok_or_else(|| EngineError::NotConfigured(provider.to_string()))?;
        let state = self
            .get_config_state(&config_id)
            .ok_or_else(|| EngineError::NotConfigured(provider.to_string()))?;
        let guard = self.within_timeout("config read", state.read()).await?;
        if !guard.config.is_active {
            // Deactivated between the index lookup and the read.
            return Err(EngineError::NotConfigured(provider.to_string()));
        }
        merge_settings(&guard.config, date, guard.overrides.get(&date))
    }
}
