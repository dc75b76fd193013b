use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::settings::validate_provider;
use super::{Engine, EngineError, now_ms};

fn validate_config(config: &ProviderSerialConfig) -> Result<(), EngineError> {
    validate_provider(&config.provider)?;
    if config.provider.id.len() > MAX_ID_LEN
        || config.provider.parent_org_id.as_ref().is_some_and(|p| p.len() > MAX_ID_LEN)
    {
        return Err(EngineError::LimitExceeded("provider id too long"));
    }
    validate_slots(config.total_slots)?;
    if !config.window.is_valid() {
        return Err(EngineError::InvalidTimeWindow(config.window));
    }
    if config.available_days.is_empty() {
        return Err(EngineError::InvalidConfig("available days must not be empty".into()));
    }
    Ok(())
}

fn validate_slots(total_slots: u32) -> Result<(), EngineError> {
    if total_slots == 0 {
        return Err(EngineError::InvalidConfig("total slots must be positive".into()));
    }
    if total_slots > MAX_SLOTS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many slots per day"));
    }
    Ok(())
}

fn validate_override(o: &DateOverride) -> Result<(), EngineError> {
    if let Some(total) = o.total_slots {
        validate_slots(total)?;
    }
    if let Some(window) = o.window
        && !window.is_valid()
    {
        return Err(EngineError::InvalidTimeWindow(window));
    }
    if o.admin_note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::LimitExceeded("admin note too long"));
    }
    Ok(())
}

impl Engine {
    /// Create a config, or replace the one with the same id. A provider keeps
    /// at most one active config; the provider of an existing id is fixed.
    pub async fn save_config(&self, config: ProviderSerialConfig) -> Result<(), EngineError> {
        validate_config(&config)?;

        let _gate = self.enter_write().await?;
        let _admin = self.within_timeout("admin lock", self.admin.lock()).await?;

        if config.is_active
            && let Some(existing) = self.active_config_id(&config.provider)
            && existing != config.id
        {
            return Err(EngineError::AlreadyActive {
                provider: config.provider.to_string(),
                existing,
            });
        }

        match self.get_config_state(&config.id) {
            Some(state) => {
                let mut guard = self.within_timeout("config lock", state.write()).await?;
                if guard.config.provider != config.provider {
                    return Err(EngineError::InvalidConfig(
                        "provider of an existing config cannot change".into(),
                    ));
                }
                let id = config.id;
                self.persist_config_event(&mut guard, &Event::ConfigSaved { config })
                    .await?;
                info!("config {id} updated");
            }
            None => {
                if self.config_count() >= MAX_CONFIGS_PER_TENANT {
                    return Err(EngineError::LimitExceeded("too many configs"));
                }
                info!("config {} created for {}", config.id, config.provider);
                self.persist_new_config(config).await?;
            }
        }
        Ok(())
    }

    /// Configs are never removed, only switched off. Deactivating twice is a no-op.
    pub async fn deactivate_config(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.enter_write().await?;
        let _admin = self.within_timeout("admin lock", self.admin.lock()).await?;

        let state = self.get_config_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = self.within_timeout("config lock", state.write()).await?;
        if !guard.config.is_active {
            return Ok(());
        }
        self.persist_config_event(&mut guard, &Event::ConfigDeactivated { id, at: now_ms() })
            .await?;
        info!("config {id} deactivated");
        Ok(())
    }

    /// Insert or replace the override for `(config_id, date)`.
    pub async fn save_override(&self, date_override: DateOverride) -> Result<(), EngineError> {
        validate_override(&date_override)?;
        let config_id = date_override.config_id;

        let _gate = self.enter_write().await?;
        let state = self
            .get_config_state(&config_id)
            .ok_or(EngineError::NotFound(config_id))?;
        let mut guard = self.within_timeout("config lock", state.write()).await?;

        if !guard.overrides.contains_key(&date_override.date)
            && guard.overrides.len() >= MAX_OVERRIDES_PER_CONFIG
        {
            return Err(EngineError::LimitExceeded("too many overrides for this config"));
        }

        let date = date_override.date;
        let enabled = date_override.enabled;
        self.persist_config_event(&mut guard, &Event::OverrideSaved { date_override })
            .await?;
        info!("override saved for config {config_id} on {date} (enabled: {enabled})");
        Ok(())
    }
}
