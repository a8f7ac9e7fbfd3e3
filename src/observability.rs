use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "innkeep_commands_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "innkeep_command_duration_seconds";

/// Counter: status-changing updates rejected by the throttle.
pub const THROTTLED_TOTAL: &str = "innkeep_status_changes_throttled_total";

// ── Reservation lifecycle ───────────────────────────────────────

/// Counter: accepted status transitions. Labels: from, to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "innkeep_status_transitions_total";

/// Counter: writes rejected because the room was already booked.
pub const AVAILABILITY_CONFLICTS_TOTAL: &str = "innkeep_availability_conflicts_total";

/// Counter: writers that found the reservation moved after locking its room.
pub const LOCK_RETRIES_TOTAL: &str = "innkeep_lock_retries_total";

// ── Upcoming view ───────────────────────────────────────────────

pub const CACHE_REFRESHES_TOTAL: &str = "innkeep_upcoming_refreshes_total";
pub const CACHE_REFRESH_FAILURES_TOTAL: &str = "innkeep_upcoming_refresh_failures_total";
pub const CACHE_REFRESH_DURATION_SECONDS: &str = "innkeep_upcoming_refresh_duration_seconds";

/// Counter: refresh triggers absorbed by an already pending refresh.
pub const CACHE_TRIGGERS_COALESCED_TOTAL: &str = "innkeep_upcoming_triggers_coalesced_total";

/// Gauge: entries in the current view.
pub const CACHE_ENTRIES: &str = "innkeep_upcoming_entries";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "innkeep_wal_compactions_total";

/// Gauge: reservations with live throttle state.
pub const THROTTLE_KEYS: &str = "innkeep_throttle_keys";

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
        Command::InsertGuest { .. } => "insert_guest",
        Command::UpdateGuest { .. } => "update_guest",
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::SelectGuests { .. } => "select_guests",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectUpcoming => "select_upcoming",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
