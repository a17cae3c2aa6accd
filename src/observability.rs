use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "theatron_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "theatron_query_duration_seconds";

/// Counter: escalations committed.
pub const ESCALATIONS_TOTAL: &str = "theatron_escalations_total";

/// Counter: bookings displaced by escalations.
pub const BOOKINGS_SHIFTED_TOTAL: &str = "theatron_bookings_shifted_total";

/// Counter: escalations reversed.
pub const ESCALATION_REVERSALS_TOTAL: &str = "theatron_escalation_reversals_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "theatron_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "theatron_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "theatron_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "theatron_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "theatron_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "theatron_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTheater { .. } => "insert_theater",
        Command::UpdateTheater { .. } => "update_theater",
        Command::DeleteTheater { .. } => "delete_theater",
        Command::InsertBooking { .. } => "insert_booking",
        Command::BatchInsertBookings { .. } => "batch_insert_bookings",
        Command::UpdateBookingTime { .. } => "update_booking_time",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectTheaters => "select_theaters",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::InsertEscalation { .. } => "insert_escalation",
        Command::DeleteEscalation { .. } => "delete_escalation",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
