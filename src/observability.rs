use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotbook_bookings_created_total";

/// Counter: booking attempts turned away. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "slotbook_bookings_rejected_total";

/// Counter: payments and refunds recorded. Labels: type, status.
pub const PAYMENTS_TOTAL: &str = "slotbook_payments_total";

/// Counter: reminder notices sent.
pub const REMINDERS_SENT_TOTAL: &str = "slotbook_reminders_sent_total";

/// Counter: notices dispatched. Labels: kind.
pub const NOTICES_TOTAL: &str = "slotbook_notices_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
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
        Command::InsertService(_) => "insert_service",
        Command::InsertLocation(_) => "insert_location",
        Command::InsertWindow(_) => "insert_window",
        Command::InsertAddOn(_) => "insert_addon",
        Command::InsertPackage { .. } => "insert_package",
        Command::UpdateService { .. } => "update_service",
        Command::UpdateAddOn { .. } => "update_addon",
        Command::Archive { .. } => "archive",
        Command::InsertBooking(_) => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::TransitionBooking { .. } => "transition_booking",
        Command::Reschedule { .. } => "reschedule",
        Command::RecordPayment { .. } => "record_payment",
        Command::Refund { .. } => "refund",
        Command::InsertConsultation(_) => "insert_consultation",
        Command::TransitionConsultation { .. } => "transition_consultation",
        Command::SelectServices => "select_services",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectPayments { .. } => "select_payments",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectQuote { .. } => "select_quote",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectWindows { .. } => "select_windows",
    }
}
