use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "serialbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "serialbook_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking attempts. Labels: source, outcome.
pub const BOOKINGS_TOTAL: &str = "serialbook_bookings_total";

/// Counter: commits refused because the serial was already held. Labels: source.
pub const SERIAL_CONFLICTS_TOTAL: &str = "serialbook_serial_conflicts_total";

/// Counter: committed status transitions. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "serialbook_status_transitions_total";

/// Counter: notification or earnings calls that failed after a commit. Labels: effect.
pub const SIDE_EFFECT_FAILURES_TOTAL: &str = "serialbook_side_effect_failures_total";

/// Counter: store operations retried after a transient failure. Labels: op.
pub const TRANSIENT_RETRIES_TOTAL: &str = "serialbook_transient_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "serialbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "serialbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "serialbook_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "serialbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "serialbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "serialbook_wal_flush_batch_size";

/// Counter: WAL appends whose sync outlasted the store timeout.
pub const WAL_SLOW_SYNCS_TOTAL: &str = "serialbook_wal_slow_syncs_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertConfig(_) => "upsert_config",
        Command::DeactivateConfig { .. } => "deactivate_config",
        Command::UpsertOverride(_) => "upsert_override",
        Command::InsertBooking {
            source: crate::model::BookingSource::SelfService,
            ..
        } => "insert_booking",
        Command::InsertBooking { .. } => "insert_walk_in",
        Command::ChangeStatus { .. } => "change_status",
        Command::SelectSettings { .. } => "select_settings",
        Command::SelectSerials { .. } => "select_serials",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectConfigs { .. } => "select_configs",
        Command::SelectOverrides { .. } => "select_overrides",
    }
}
