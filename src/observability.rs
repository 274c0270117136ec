use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomswap_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomswap_query_duration_seconds";

/// Counter: change requests admitted into Pending.
pub const REQUESTS_SUBMITTED_TOTAL: &str = "roomswap_requests_submitted_total";

/// Counter: decisions executed. Labels: outcome (approved/rejected).
pub const DECISIONS_TOTAL: &str = "roomswap_decisions_total";

/// Counter: approvals refused because the desired room had no free slot.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "roomswap_reservation_conflicts_total";

/// Counter: broken atomicity guarantees (occupancy underflow). Must stay 0.
pub const INTEGRITY_ALERTS_TOTAL: &str = "roomswap_integrity_alerts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomswap_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomswap_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomswap_connections_rejected_total";

/// Gauge: number of active sites (loaded engines).
pub const SITES_ACTIVE: &str = "roomswap_sites_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomswap_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomswap_wal_flush_batch_size";

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
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::InsertTenant { .. } => "insert_tenant",
        Command::DeactivateTenant { .. } => "deactivate_tenant",
        Command::ReassignTenant { .. } => "reassign_tenant",
        Command::SubmitRequest { .. } => "submit_request",
        Command::ApproveRequest { .. } => "approve_request",
        Command::RejectRequest { .. } => "reject_request",
        Command::SelectRequests { .. } => "select_requests",
        Command::SelectRequest { .. } => "select_request",
        Command::SelectOutstanding { .. } => "select_outstanding",
        Command::SelectRooms => "select_rooms",
        Command::SelectTenants => "select_tenants",
    }
}
