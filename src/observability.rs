use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Coordinator cycles ───────────────────────────────────────────

/// Counter: scheduling cycles run. Labels: status (ok, failed).
pub const CYCLES_TOTAL: &str = "allotter_cycles_total";

/// Histogram: wall time of one cycle, lock wait included, in seconds.
pub const CYCLE_DURATION_SECONDS: &str = "allotter_cycle_duration_seconds";

/// Histogram: time spent waiting for the execution lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "allotter_lock_wait_seconds";

// ── Requests ─────────────────────────────────────────────────────

/// Counter: concrete requests touched by pre-processing. Labels: change (created, updated, removed, failed).
pub const REQUESTS_MATERIALIZED_TOTAL: &str = "allotter_requests_materialized_total";

/// Counter: allocation attempts. Labels: status (allocated, failed).
pub const ALLOCATIONS_TOTAL: &str = "allotter_allocations_total";

/// Counter: notifications delivered by flushes.
pub const NOTIFICATIONS_FLUSHED_TOTAL: &str = "allotter_notifications_flushed_total";

// ── State ────────────────────────────────────────────────────────

/// Gauge: resources registered in the availability cache.
pub const RESOURCES_CACHED: &str = "allotter_resources_cached";

/// Counter: storage journal compactions.
pub const JOURNAL_COMPACTIONS_TOTAL: &str = "allotter_journal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
