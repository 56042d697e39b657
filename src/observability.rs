use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Counter: booking operations. Labels: op, outcome.
pub const BOOKINGS_TOTAL: &str = "chairbook_bookings_total";

/// Counter: audit/notification deliveries that failed or were dropped. Labels: kind.
pub const SIDE_EFFECT_FAILURES_TOTAL: &str = "chairbook_side_effect_failures_total";

/// Counter: reminders delivered.
pub const REMINDERS_SENT_TOTAL: &str = "chairbook_reminders_sent_total";

/// Counter: reminders that could not be delivered.
pub const REMINDERS_FAILED_TOTAL: &str = "chairbook_reminders_failed_total";

/// Histogram: duration of one reminder pass in seconds.
pub const REMINDER_PASS_DURATION_SECONDS: &str = "chairbook_reminder_pass_duration_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
