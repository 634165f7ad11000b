use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "caresched_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "caresched_query_duration_seconds";

// ── Scheduling metrics ──────────────────────────────────────────

/// Counter: writes rejected for overlapping an existing record. Labels: scope.
pub const CONFLICTS_TOTAL: &str = "caresched_conflicts_total";

/// Counter: appointments booked.
pub const BOOKINGS_TOTAL: &str = "caresched_bookings_total";

pub const CONFIRMATIONS_SENT_TOTAL: &str = "caresched_confirmations_sent_total";

pub const CONFIRMATIONS_EXPIRED_TOTAL: &str = "caresched_confirmations_expired_total";

/// Gauge: registered doctors.
pub const DOCTORS_ACTIVE: &str = "caresched_doctors_active";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "caresched_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "caresched_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "caresched_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "caresched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "caresched_wal_flush_batch_size";

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

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertDoctor { .. } => "insert_doctor",
        Command::DeleteDoctor { .. } => "delete_doctor",
        Command::InsertSchedule { upsert: false, .. } => "insert_schedule",
        Command::InsertSchedule { upsert: true, .. } => "upsert_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::InsertAppointment { upsert: false, .. } => "insert_appointment",
        Command::InsertAppointment { upsert: true, .. } => "reschedule_appointment",
        Command::DeleteAppointment { .. } => "cancel_appointment",
        Command::SetAppointmentStatus { .. } => "set_appointment_status",
        Command::ConfirmToken { .. } => "confirm_token",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectDoctors => "select_doctors",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectConfirmation { .. } => "select_confirmation",
    }
}
