mod allocator;
mod booking;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod settings;

pub use allocator::{SerialAvailability, self_service_candidates};
pub use booking::BookingRequest;
pub use error::{EngineError, ErrorKind};
pub use lifecycle::{Effects, StatusChange, check_transition};
pub use settings::merge_settings;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::earnings::{EarningsLedger, EarningsRecorder};
use crate::model::*;
use crate::notify::{NotificationGateway, NotifyHub};
use crate::observability;
use crate::wal::{Wal, WalHandle};

pub type SharedConfigState = Arc<RwLock<ConfigState>>;
pub type SharedDayLedger = Arc<RwLock<DayLedger>>;

/// Side-effect targets invoked after a status change commits.
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn NotificationGateway>,
    pub earnings: Arc<dyn EarningsRecorder>,
}

impl Collaborators {
    /// In-process hub and ledger.
    pub fn in_process() -> (Self, Arc<NotifyHub>, Arc<EarningsLedger>) {
        let hub = Arc::new(NotifyHub::new());
        let ledger = Arc::new(EarningsLedger::new());
        let collaborators = Self {
            notifier: hub.clone(),
            earnings: ledger.clone(),
        };
        (collaborators, hub, ledger)
    }
}

/// One tenant's store: configs, overrides and day ledgers, all recovered from
/// the WAL at startup.
///
/// Lock order is `write_gate` → day ledger → config state. Admin writes take
/// `write_gate` → `admin` → config state and never touch day ledgers.
pub struct Engine {
    configs: DashMap<Ulid, SharedConfigState>,
    /// Provider → its active config.
    active_by_provider: DashMap<ProviderKey, Ulid>,
    days: DashMap<DayKey, SharedDayLedger>,
    /// Booking id → the day ledger holding it.
    booking_index: DashMap<Ulid, DayKey>,
    /// Writers share it; compaction takes it exclusively so the snapshot and
    /// the log swap see no in-flight appends.
    write_gate: RwLock<()>,
    /// Serializes config administration so "one active config per provider" holds.
    admin: Mutex<()>,
    wal: WalHandle,
    collaborators: Collaborators,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);

        let engine = Self {
            configs: DashMap::new(),
            active_by_provider: DashMap::new(),
            days: DashMap::new(),
            booking_index: DashMap::new(),
            write_gate: RwLock::new(()),
            admin: Mutex::new(()),
            wal,
            collaborators,
            config,
        };

        for event in &events {
            engine.replay_event(event);
        }
        debug!("replayed {} events from {}", events.len(), wal_path.display());
        Ok(engine)
    }

    /// Nothing else holds these locks during replay, so `try_write` always succeeds.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ConfigSaved { config } => match self.get_config_state(&config.id) {
                Some(state) => {
                    if let Ok(mut guard) = state.try_write() {
                        let previous = guard.config.clone();
                        apply_to_config(&mut guard, event);
                        self.reindex_config(Some(&previous), config);
                    }
                }
                None => {
                    self.reindex_config(None, config);
                    self.configs.insert(
                        config.id,
                        Arc::new(RwLock::new(ConfigState::new(config.clone()))),
                    );
                }
            },
            Event::ConfigDeactivated { id: config_id, .. }
            | Event::OverrideSaved {
                date_override: DateOverride { config_id, .. },
            } => {
                let Some(state) = self.get_config_state(config_id) else {
                    warn!("replay: event for unknown config {config_id}");
                    return;
                };
                if let Ok(mut guard) = state.try_write() {
                    let previous = guard.config.clone();
                    apply_to_config(&mut guard, event);
                    self.reindex_config(Some(&previous), &guard.config);
                }
            }
            Event::BookingCreated { booking } => {
                let key = DayKey::new(booking.provider.clone(), booking.date);
                let ledger = self.day_ledger_or_create(&key);
                if let Ok(mut guard) = ledger.try_write()
                    && !apply_to_day(&mut guard, event, &self.booking_index)
                {
                    warn!("replay: skipped duplicate booking {} ({key})", booking.id);
                }
            }
            Event::StatusChanged { day, .. } => {
                if let Some(ledger) = self.get_day_ledger(day)
                    && let Ok(mut guard) = ledger.try_write()
                {
                    apply_to_day(&mut guard, event, &self.booking_index);
                }
            }
        }
    }

    // ── Lookup helpers ───────────────────────────────────────

    pub(crate) fn get_config_state(&self, id: &Ulid) -> Option<SharedConfigState> {
        self.configs.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn active_config_id(&self, provider: &ProviderKey) -> Option<Ulid> {
        self.active_by_provider.get(provider).map(|e| *e.value())
    }

    pub(crate) fn get_day_ledger(&self, key: &DayKey) -> Option<SharedDayLedger> {
        self.days.get(key).map(|e| e.value().clone())
    }

    fn day_ledger_or_create(&self, key: &DayKey) -> SharedDayLedger {
        self.days
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(key.clone()))))
            .value()
            .clone()
    }

    /// Keep `active_by_provider` consistent after a config changed from `previous` to `current`.
    fn reindex_config(&self, previous: Option<&ProviderSerialConfig>, current: &ProviderSerialConfig) {
        if let Some(prev) = previous
            && prev.is_active
        {
            self.active_by_provider
                .remove_if(&prev.provider, |_, id| *id == prev.id);
        }
        if current.is_active {
            self.active_by_provider
                .insert(current.provider.clone(), current.id);
        }
    }

    // ── Store calls ──────────────────────────────────────────

    /// Bound a store operation by the configured timeout.
    pub(crate) async fn within_timeout<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = T>,
    ) -> Result<T, EngineError> {
        tokio::time::timeout(self.config.store_timeout, fut)
            .await
            .map_err(|_| EngineError::Timeout(op))
    }

    /// Run `attempt` until it succeeds, fails non-transiently, or the retry
    /// budget is spent. Only transient errors are retried.
    pub(crate) async fn with_retry<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let policy = self.config.retry;
        let mut n = 1;
        loop {
            match attempt().await {
                Err(e) if e.is_transient() && n < policy.attempts => {
                    let delay = policy.backoff(n);
                    warn!("{op}: transient failure on attempt {n}/{}: {e}; retrying in {delay:?}", policy.attempts);
                    metrics::counter!(observability::TRANSIENT_RETRIES_TOTAL, "op" => op).increment(1);
                    tokio::time::sleep(delay).await;
                    n += 1;
                }
                other => return other,
            }
        }
    }

    /// Enter the shared side of the write gate.
    pub(crate) async fn enter_write(&self) -> Result<tokio::sync::RwLockReadGuard<'_, ()>, EngineError> {
        self.within_timeout("write gate", self.write_gate.read()).await
    }

    pub(crate) async fn lock_day(&self, key: &DayKey) -> Result<OwnedRwLockWriteGuard<DayLedger>, EngineError> {
        let ledger = self.day_ledger_or_create(key);
        self.within_timeout("day lock", ledger.write_owned()).await
    }

    /// Only the enqueue is bounded. A queued record reaches disk regardless, so
    /// the caller waits for its outcome with the lock still held and applies it.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let ticket = self
            .within_timeout("wal enqueue", self.wal.enqueue(event))
            .await?
            .map_err(|e| EngineError::Store(e.to_string()))?;

        let mut durable = std::pin::pin!(ticket.durable());
        let synced = match tokio::time::timeout(self.config.store_timeout, &mut durable).await {
            Ok(synced) => synced,
            Err(_) => {
                warn!(
                    "wal sync slower than {:?}, waiting for it to land",
                    self.config.store_timeout
                );
                metrics::counter!(observability::WAL_SLOW_SYNCS_TOTAL).increment(1);
                durable.await
            }
        };
        synced.map_err(|e| EngineError::Store(e.to_string()))
    }

    /// Durably log a booking event, then apply it to the locked ledger.
    pub(crate) async fn persist_day_event(
        &self,
        ledger: &mut DayLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(ledger, event, &self.booking_index);
        Ok(())
    }

    /// Durably log a config event, then apply it to the locked config state.
    pub(crate) async fn persist_config_event(
        &self,
        state: &mut ConfigState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let previous = state.config.clone();
        apply_to_config(state, event);
        self.reindex_config(Some(&previous), &state.config);
        Ok(())
    }

    /// Log and register a config id seen for the first time.
    pub(crate) async fn persist_new_config(&self, config: ProviderSerialConfig) -> Result<(), EngineError> {
        let event = Event::ConfigSaved { config: config.clone() };
        self.wal_append(&event).await?;
        self.reindex_config(None, &config);
        self.configs
            .insert(config.id, Arc::new(RwLock::new(ConfigState::new(config))));
        Ok(())
    }

    pub(crate) fn config_count(&self) -> usize {
        self.configs.len()
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    // ── Compaction ───────────────────────────────────────────

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.write_gate.write().await;

        let mut events = Vec::new();
        let config_states: Vec<SharedConfigState> =
            self.configs.iter().map(|e| e.value().clone()).collect();
        for state in config_states {
            let guard = state.read().await;
            events.push(Event::ConfigSaved {
                config: guard.config.clone(),
            });
            events.extend(guard.overrides.values().map(|o| Event::OverrideSaved {
                date_override: o.clone(),
            }));
        }

        let ledgers: Vec<SharedDayLedger> = self.days.iter().map(|e| e.value().clone()).collect();
        for ledger in ledgers {
            let guard = ledger.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        }

        let count = events.len();
        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(count)
    }
}

/// Apply a booking event to a ledger. Returns false if it was a no-op
/// (duplicate id, already-held serial, or unknown booking).
pub(crate) fn apply_to_day(
    ledger: &mut DayLedger,
    event: &Event,
    index: &DashMap<Ulid, DayKey>,
) -> bool {
    match event {
        Event::BookingCreated { booking } => {
            let id = booking.id;
            if ledger.insert(booking.clone()) {
                index.insert(id, ledger.key.clone());
                true
            } else {
                false
            }
        }
        Event::StatusChanged { id, change, .. } => ledger.set_status(id, change).is_some(),
        _ => false,
    }
}

pub(crate) fn apply_to_config(state: &mut ConfigState, event: &Event) {
    match event {
        Event::ConfigSaved { config } => state.config = config.clone(),
        Event::ConfigDeactivated { .. } => state.config.is_active = false,
        Event::OverrideSaved { date_override } => {
            state
                .overrides
                .insert(date_override.date, date_override.clone());
        }
        Event::BookingCreated { .. } | Event::StatusChanged { .. } => {}
    }
}

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}
