use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: SQL statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "lineup_queries_total";

/// Histogram: SQL statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "lineup_query_duration_seconds";

/// Counter: HTTP requests. Labels: method, route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "lineup_http_requests_total";

/// Histogram: HTTP latency in seconds. Labels: method, route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "lineup_http_request_duration_seconds";

/// Counter: booking writes rejected for overlap. Labels: axis.
pub const BOOKING_CONFLICTS_TOTAL: &str = "lineup_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open pgwire connections.
pub const CONNECTIONS_ACTIVE: &str = "lineup_connections_active";

/// Counter: pgwire connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lineup_connections_total";

/// Counter: pgwire connections turned away at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lineup_connections_rejected_total";

/// Gauge: open server-sent event streams.
pub const EVENT_STREAMS_ACTIVE: &str = "lineup_event_streams_active";

/// Counter: rejected bearer tokens and role checks.
pub const AUTH_FAILURES_TOTAL: &str = "lineup_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lineup_wal_flush_duration_seconds";

/// Histogram: events per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "lineup_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "lineup_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertArtist { .. } => "insert_artist",
        Command::UpdateArtist { .. } => "update_artist",
        Command::DeleteArtist { .. } => "delete_artist",
        Command::InsertStage { .. } => "insert_stage",
        Command::UpdateStage { .. } => "update_stage",
        Command::DeleteStage { .. } => "delete_stage",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectArtists => "select_artists",
        Command::SelectStages => "select_stages",
        Command::SelectRunningOrder { .. } => "select_running_order",
        Command::SelectConflicts { .. } => "select_conflicts",
    }
}
