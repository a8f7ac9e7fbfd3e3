use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Date ordering and range checks. Runs before the state machine or the guard.
pub(crate) fn validate_stay(arrival: NaiveDate, departure: NaiveDate) -> Result<DateRange, EngineError> {
    if arrival > departure {
        return Err(EngineError::InvalidDateRange { arrival, departure });
    }
    let valid_year = MIN_VALID_YEAR..=MAX_VALID_YEAR;
    if !valid_year.contains(&arrival.year()) || !valid_year.contains(&departure.year()) {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    let stay = DateRange::new(arrival, departure);
    if stay.nights() > MAX_STAY_DAYS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(stay)
}

pub(crate) fn validate_first_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidField("first_name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("first_name too long"));
    }
    Ok(())
}

pub(crate) fn validate_last_name(name: Option<&str>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("last_name too long"));
    }
    Ok(())
}

pub(crate) fn validate_room_number(number: &str) -> Result<(), EngineError> {
    if number.is_empty() {
        return Err(EngineError::InvalidField("room number is required"));
    }
    if number.len() > MAX_ROOM_NUMBER_LEN {
        return Err(EngineError::LimitExceeded("room number too long"));
    }
    if !number.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::InvalidField("room number must be alphanumeric"));
    }
    Ok(())
}

/// The availability guard. The caller must hold the room's write lock through
/// the commit that follows, or the answer is stale by the time it is used.
///
/// `exclude` is the reservation being written, which never conflicts with itself.
pub fn check_availability(
    rs: &RoomState,
    stay: &DateRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let conflict = rs.overlapping(stay).find(|r| Some(r.id) != exclude);
    match conflict {
        Some(r) => Err(EngineError::AvailabilityConflict {
            room_id: rs.id(),
            conflicting: r.stay(),
            reservation_id: r.id,
        }),
        None => Ok(()),
    }
}
