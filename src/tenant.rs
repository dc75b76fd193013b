use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::config::EngineConfig;
use crate::engine::{Collaborators, Engine};
use crate::limits::*;

/// Builds the notification and earnings targets for a tenant when it is first loaded.
pub type CollaboratorFactory = Arc<dyn Fn(&str) -> Collaborators + Send + Sync>;

/// A fresh in-process hub and ledger per tenant.
pub fn in_process_collaborators() -> CollaboratorFactory {
    Arc::new(|_tenant: &str| Collaborators::in_process().0)
}

/// Per-tenant engines. Each tenant gets its own Engine, WAL and compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    engine_config: EngineConfig,
    collaborators: CollaboratorFactory,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        engine_config: EngineConfig,
        collaborators: CollaboratorFactory,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            engine_config,
            collaborators,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Path traversal guard
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // The entry lock keeps two first connections from opening the same WAL twice.
        let engines_len = self.engines.len();
        match self.engines.entry(tenant.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if engines_len >= MAX_TENANTS {
                    return Err(std::io::Error::other("too many tenants"));
                }
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let collaborators = (self.collaborators)(tenant);
                let engine = Arc::new(Engine::new(wal_path, collaborators, self.engine_config)?);

                let compactor_engine = engine.clone();
                let threshold = self.compact_threshold;
                tokio::spawn(async move {
                    compactor::run_compactor(compactor_engine, threshold).await;
                });

                slot.insert(engine.clone());
                metrics::gauge!(crate::observability::TENANTS_ACTIVE).set((engines_len + 1) as f64);
                tracing::info!("tenant {tenant} loaded");
                Ok(engine)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::earnings::EarningsLedger;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use chrono::NaiveDate;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("serialbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, EngineConfig::default(), in_process_collaborators())
    }

    fn doctor_config(provider: &ProviderKey) -> ProviderSerialConfig {
        ProviderSerialConfig {
            id: Ulid::new(),
            provider: provider.clone(),
            total_slots: 6,
            window: TimeWindow::hours(9, 12),
            price: 100,
            available_days: AvailableDays::ALL,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let eng_a = tm.get_or_create("clinic_a").unwrap();
        let eng_b = tm.get_or_create("clinic_b").unwrap();

        let provider = ProviderKey::individual("dr-1");
        let config = doctor_config(&provider);
        eng_a.save_config(config.clone()).await.unwrap();
        eng_b.save_config(config).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        eng_a
            .create_booking(BookingRequest::new(provider.clone(), date, 2, "p-1"))
            .await
            .unwrap();

        // Same serial is still free in the other tenant
        let avail_b = eng_b.available_serials(&provider, date).await.unwrap();
        assert_eq!(avail_b.serials, vec![2, 4, 6]);
        let avail_a = eng_a.available_serials(&provider, date).await.unwrap();
        assert_eq!(avail_a.serials, vec![4, 6]);
    }

    #[tokio::test]
    async fn injected_collaborators_see_tenant_side_effects() {
        let ledgers: Arc<DashMap<String, Arc<EarningsLedger>>> = Arc::new(DashMap::new());
        let factory: CollaboratorFactory = {
            let ledgers = ledgers.clone();
            Arc::new(move |tenant: &str| {
                let (collaborators, _, ledger) = Collaborators::in_process();
                ledgers.insert(tenant.to_string(), ledger);
                collaborators
            })
        };
        let tm = TenantManager::new(
            test_data_dir("injected"),
            1000,
            EngineConfig::default(),
            factory,
        );

        let engine = tm.get_or_create("clinic_a").unwrap();
        tm.get_or_create("clinic_b").unwrap();
        let provider = ProviderKey::individual("dr-1");
        engine.save_config(doctor_config(&provider)).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let booking = engine
            .create_booking(BookingRequest::new(provider.clone(), date, 2, "p-1"))
            .await
            .unwrap();
        engine.accept(booking.id).await.unwrap();
        engine.complete(booking.id).await.unwrap();

        let ledger_a = ledgers.get("clinic_a").unwrap().value().clone();
        let entry = ledger_a.get(&booking.id).unwrap();
        assert_eq!(entry.fee, 100);
        assert_eq!(ledger_a.total_for(&provider), 100);
        assert!(ledgers.get("clinic_b").unwrap().value().is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
