use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{DateRange, Status};

/// A status change the lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub previous: Status,
    pub requested: Status,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reservation cannot transition from {} to {}",
            self.previous, self.requested
        )
    }
}

impl std::error::Error for TransitionError {}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Transition(TransitionError),
    AvailabilityConflict {
        room_id: Ulid,
        conflicting: DateRange,
        reservation_id: Ulid,
    },
    InvalidDateRange {
        arrival: NaiveDate,
        departure: NaiveDate,
    },
    ImmutableField(&'static str),
    DuplicateRoomNumber(String),
    InvalidField(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl From<TransitionError> for EngineError {
    fn from(e: TransitionError) -> Self {
        EngineError::Transition(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Transition(e) => write!(f, "{e}"),
            EngineError::AvailabilityConflict {
                room_id,
                conflicting,
                reservation_id,
            } => write!(
                f,
                "room {room_id} is already reserved for {conflicting} by reservation {reservation_id}"
            ),
            EngineError::InvalidDateRange { arrival, departure } => write!(
                f,
                "arrival date {arrival} must not be after departure date {departure}"
            ),
            EngineError::ImmutableField(field) => write!(f, "{field} cannot be changed"),
            EngineError::DuplicateRoomNumber(number) => {
                write!(f, "room number already in use: {number}")
            }
            EngineError::InvalidField(msg) => write!(f, "invalid field: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Transition(e) => Some(e),
            _ => None,
        }
    }
}
