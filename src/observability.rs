use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Booking flow ────────────────────────────────────────────────

/// Counter: hold attempts. Labels: outcome (placed, rejected).
pub const HOLDS_TOTAL: &str = "slotbook_holds_total";

/// Counter: booking transitions. Labels: outcome (confirmed, rejected, cancelled).
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Counter: buffer writes that failed after a durable confirm or cancel.
pub const BUFFER_FAILURES_TOTAL: &str = "slotbook_buffer_failures_total";

/// Counter: slots inserted or repriced by generation.
pub const SLOTS_GENERATED_TOTAL: &str = "slotbook_slots_generated_total";

// ── Expiry sweeper ──────────────────────────────────────────────

pub const SWEEP_EXPIRED_HOLDS_TOTAL: &str = "slotbook_sweep_expired_holds_total";

pub const SWEEP_EXPIRED_BUFFERS_TOTAL: &str = "slotbook_sweep_expired_buffers_total";

/// Histogram: wall time of one sweep in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "slotbook_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the service keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on port {port}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::DeclareAvailability { .. } => "declare_availability",
        Command::WithdrawAvailability { .. } => "withdraw_availability",
        Command::SelectAvailability { .. } => "select_availability",
        Command::PutSurchargeRule { .. } => "put_surcharge_rule",
        Command::DeleteSurchargeRule { .. } => "delete_surcharge_rule",
        Command::SelectSurchargeRules { .. } => "select_surcharge_rules",
        Command::GenerateSlots { .. } => "generate_slots",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSlot { .. } => "select_slot",
        Command::SelectAvailableSlots { .. } => "select_available_slots",
        Command::RevokeSlots { .. } => "revoke_slots",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
