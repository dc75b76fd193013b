use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a tenant's WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Returns the number of events written, or `None` if compaction did not run.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Option<usize> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return None;
    }
    match engine.compact_wal().await {
        Ok(events) => {
            info!("compacted WAL: {appends} appends since last compaction, {events} events kept");
            Some(events)
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            None
        }
    }
}
