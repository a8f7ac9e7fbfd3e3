use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for throttle bookkeeping.
pub type Ms = i64;

/// Reservation lifecycle state. Ordering follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    CheckedIn,
    CheckedOut,
}

impl Status {
    /// The single status reachable from this one, if any.
    pub fn next(self) -> Option<Status> {
        match self {
            Status::Pending => Some(Status::CheckedIn),
            Status::CheckedIn => Some(Status::CheckedOut),
            Status::CheckedOut => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::CheckedIn => "checked_in",
            Status::CheckedOut => "checked_out",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "checked_in" => Ok(Status::CheckedIn),
            "checked_out" => Ok(Status::CheckedOut),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Half-open stay `[arrival, departure)`, in calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub arrival: NaiveDate,
    pub departure: NaiveDate,
}

impl DateRange {
    pub fn new(arrival: NaiveDate, departure: NaiveDate) -> Self {
        debug_assert!(arrival <= departure, "arrival must not be after departure");
        Self { arrival, departure }
    }

    pub fn nights(&self) -> i64 {
        (self.departure - self.arrival).num_days()
    }

    /// Shared boundary days do not count: a departure may equal another arrival.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.arrival < other.departure && other.arrival < self.departure
    }

    #[cfg(test)]
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.arrival <= day && day < self.departure
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.arrival, self.departure)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub id: Ulid,
    pub first_name: String,
    pub last_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub number: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub guest_id: Ulid,
    pub room_id: Ulid,
    pub arrival: NaiveDate,
    pub departure: NaiveDate,
    pub status: Status,
    pub checkin_at: Option<DateTime<Utc>>,
    pub checkout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn stay(&self) -> DateRange {
        DateRange::new(self.arrival, self.departure)
    }
}

/// A reservation as requested by a client. `status` is accepted but ignored:
/// every reservation starts `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub guest_id: Ulid,
    pub room_id: Ulid,
    pub arrival: NaiveDate,
    pub departure: NaiveDate,
    pub status: Option<Status>,
}

/// Requested changes to a guest. `last_name: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestPatch {
    pub first_name: Option<String>,
    pub last_name: Option<Option<String>>,
}

/// Requested changes to a reservation. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub status: Option<Status>,
    pub room_id: Option<Ulid>,
    pub guest_id: Option<Ulid>,
    pub arrival: Option<NaiveDate>,
    pub departure: Option<NaiveDate>,
}

impl ReservationPatch {
    pub fn includes_status(&self) -> bool {
        self.status.is_some()
    }
}

/// A room plus its interval index: every reservation on the room, sorted by arrival.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.room.id
    }

    /// Insert maintaining sort order by arrival.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.arrival, |r| r.arrival)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Replace a reservation in place. Dates are immutable, so sort order holds.
    pub fn replace_reservation(&mut self, reservation: Reservation) -> bool {
        match self.reservations.iter_mut().find(|r| r.id == reservation.id) {
            Some(slot) => {
                debug_assert_eq!(slot.arrival, reservation.arrival);
                *slot = reservation;
                true
            }
            None => false,
        }
    }

    /// Reservations whose stay overlaps `query`.
    /// Binary search skips every reservation arriving on or after `query.departure`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.arrival < query.departure);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.departure > query.arrival)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    GuestCreated {
        id: Ulid,
        first_name: String,
        last_name: Option<String>,
        at: DateTime<Utc>,
    },
    GuestUpdated {
        id: Ulid,
        first_name: String,
        last_name: Option<String>,
        at: DateTime<Utc>,
    },
    RoomCreated {
        id: Ulid,
        number: String,
        at: DateTime<Utc>,
    },
    RoomUpdated {
        id: Ulid,
        number: String,
        at: DateTime<Utc>,
    },
    ReservationCreated {
        id: Ulid,
        guest_id: Ulid,
        room_id: Ulid,
        arrival: NaiveDate,
        departure: NaiveDate,
        at: DateTime<Utc>,
    },
    /// `room_id` is the room the reservation lives in after the update.
    ReservationUpdated {
        id: Ulid,
        guest_id: Ulid,
        room_id: Ulid,
        status: Status,
        checkin_at: Option<DateTime<Utc>>,
        checkout_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
}
