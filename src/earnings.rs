use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Money, ProviderKey};

#[derive(Debug, Error)]
pub enum EarningsError {
    #[error("earnings store unavailable: {0}")]
    Unavailable(String),
}

/// Records a provider's revenue for a completed booking.
///
/// Implementations must be idempotent on `booking_id`: a second call for the
/// same booking records nothing.
#[async_trait]
pub trait EarningsRecorder: Send + Sync {
    async fn record(
        &self,
        provider: &ProviderKey,
        booking_id: Ulid,
        fee: Money,
    ) -> Result<(), EarningsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarningsEntry {
    pub provider: ProviderKey,
    pub booking_id: Ulid,
    pub fee: Money,
}

/// In-memory ledger keyed by booking id.
#[derive(Default)]
pub struct EarningsLedger {
    entries: DashMap<Ulid, EarningsEntry>,
}

impl EarningsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, booking_id: &Ulid) -> Option<EarningsEntry> {
        self.entries.get(booking_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_for(&self, provider: &ProviderKey) -> Money {
        self.entries
            .iter()
            .filter(|e| &e.value().provider == provider)
            .map(|e| e.value().fee)
            .sum()
    }
}

#[async_trait]
impl EarningsRecorder for EarningsLedger {
    async fn record(
        &self,
        provider: &ProviderKey,
        booking_id: Ulid,
        fee: Money,
    ) -> Result<(), EarningsError> {
        match self.entries.entry(booking_id) {
            Entry::Occupied(_) => {
                tracing::debug!("earnings for booking {booking_id} already recorded");
            }
            Entry::Vacant(slot) => {
                slot.insert(EarningsEntry {
                    provider: provider.clone(),
                    booking_id,
                    fee,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_twice_does_not_double_count() {
        let ledger = EarningsLedger::new();
        let provider = ProviderKey::individual("dr-1");
        let booking = Ulid::new();

        ledger.record(&provider, booking, 800).await.unwrap();
        ledger.record(&provider, booking, 800).await.unwrap();

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.total_for(&provider), 800);
    }

    #[tokio::test]
    async fn totals_are_per_provider() {
        let ledger = EarningsLedger::new();
        let a = ProviderKey::individual("a");
        let b = ProviderKey::hospital("b", "h1");

        ledger.record(&a, Ulid::new(), 100).await.unwrap();
        ledger.record(&a, Ulid::new(), 250).await.unwrap();
        ledger.record(&b, Ulid::new(), 900).await.unwrap();

        assert_eq!(ledger.total_for(&a), 350);
        assert_eq!(ledger.total_for(&b), 900);
        assert_eq!(ledger.get(&Ulid::new()), None);
    }
}
