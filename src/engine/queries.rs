use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::upcoming::{is_current_or_upcoming, UpcomingEntry};

use super::conflict::{check_availability, validate_stay};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_guest(&self, id: &Ulid) -> Option<Guest> {
        self.committed_guest(id).await.ok()
    }

    /// All guests, ordered by last name then first name. Missing last names sort first.
    pub async fn list_guests(&self) -> Vec<Guest> {
        let ids: Vec<Ulid> = self.guests.iter().map(|e| *e.key()).collect();
        let mut guests = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(g) = self.get_guest(&id).await {
                guests.push(g);
            }
        }
        guests.sort_by(|a, b| {
            (&a.last_name, &a.first_name, a.id).cmp(&(&b.last_name, &b.first_name, b.id))
        });
        guests
    }

    pub async fn get_room(&self, id: &Ulid) -> Option<Room> {
        let rs = self.get_room_state(id)?;
        let room = rs.read().await.room.clone();
        self.is_committed_room(id, &rs).then_some(room)
    }

    /// All rooms, ordered by room number.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(room) = self.get_room(&id).await {
                rooms.push(room);
            }
        }
        rooms.sort_by(|a, b| a.number.cmp(&b.number));
        rooms
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        loop {
            let room_id = self.room_for_reservation(id)?;
            let rs = self.get_room_state(&room_id)?;
            let guard = rs.read().await;
            if let Some(r) = guard.get(*id) {
                return Some(r.clone());
            }
            // Moved to another room while we waited for the lock.
            if self.room_for_reservation(id) == Some(room_id) {
                return None;
            }
        }
    }

    /// Reservations on one room, or on every room, ordered by arrival date.
    pub async fn list_reservations(
        &self,
        room_id: Option<Ulid>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rooms: Vec<_> = match room_id {
            Some(id) => vec![self.get_room_state(&id).ok_or(EngineError::NotFound(id))?],
            None => self.rooms.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for rs in rooms {
            out.extend(rs.read().await.reservations.iter().cloned());
        }
        out.sort_by(|a, b| (a.arrival, a.id).cmp(&(b.arrival, b.id)));
        Ok(out)
    }

    /// Read-only availability probe. Advisory only: nothing is held once this
    /// returns, so a later booking can still lose the race.
    pub async fn check_availability(
        &self,
        room_id: Ulid,
        arrival: NaiveDate,
        departure: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let stay = validate_stay(arrival, departure)?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        check_availability(&guard, &stay, exclude)
    }

    /// Denormalized rows for the upcoming-reservations view, ordered by arrival.
    ///
    /// Each room is read under its own lock, so the result is consistent per room.
    pub async fn upcoming_entries(&self, today: NaiveDate, horizon_days: i64) -> Vec<UpcomingEntry> {
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut matched = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            for r in &guard.reservations {
                if is_current_or_upcoming(r.arrival, r.departure, today, horizon_days) {
                    matched.push((r.clone(), guard.room.number.clone()));
                }
            }
        }

        let mut entries = Vec::with_capacity(matched.len());
        for (r, room_number) in matched {
            let (first_name, last_name) = match self.get_guest(&r.guest_id).await {
                Some(g) => (g.first_name, g.last_name),
                None => (String::new(), None),
            };
            entries.push(UpcomingEntry {
                reservation_id: r.id,
                guest_id: r.guest_id,
                room_id: r.room_id,
                first_name,
                last_name,
                room_number,
                arrival: r.arrival,
                departure: r.departure,
                status: r.status,
                checkin_at: r.checkin_at,
                checkout_at: r.checkout_at,
            });
        }
        entries.sort_by(|a, b| (a.arrival, a.reservation_id).cmp(&(b.arrival, b.reservation_id)));
        entries
    }

    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_to_room.len()
    }
}
