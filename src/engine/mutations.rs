use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    AVAILABILITY_CONFLICTS_TOTAL, LOCK_RETRIES_TOTAL, STATUS_TRANSITIONS_TOTAL,
    WAL_COMPACTIONS_TOTAL,
};

use super::conflict::{
    check_availability, validate_first_name, validate_last_name, validate_room_number,
    validate_stay,
};
use super::{
    apply_status_transition, lock_room_pair, update_event, Commit, Engine, EngineError,
    WalCommand,
};

fn conflict_counted(result: Result<(), EngineError>) -> Result<(), EngineError> {
    result.inspect_err(|_| metrics::counter!(AVAILABILITY_CONFLICTS_TOTAL).increment(1))
}

impl Engine {
    pub async fn create_guest(
        &self,
        id: Ulid,
        first_name: String,
        last_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Commit, EngineError> {
        validate_first_name(&first_name)?;
        validate_last_name(last_name.as_deref())?;
        let _gate = self.commit_gate.read().await;
        if self.guests.len() >= MAX_GUESTS {
            return Err(EngineError::LimitExceeded("too many guests"));
        }

        let event = Event::GuestCreated {
            id,
            first_name: first_name.clone(),
            last_name: last_name.clone(),
            at: now,
        };
        let guest = Arc::new(RwLock::new(Guest {
            id,
            first_name,
            last_name,
            created_at: now,
            updated_at: now,
        }));
        // Published locked: readers wait until the WAL answers.
        let _pending = guest.clone().write_owned().await;
        match self.guests.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(guest);
            }
        }
        if let Err(e) = self.wal_append(&event).await {
            self.guests.remove(&id);
            return Err(e);
        }
        Ok(self.committed())
    }

    pub async fn update_guest(
        &self,
        id: Ulid,
        patch: GuestPatch,
        now: DateTime<Utc>,
    ) -> Result<Commit, EngineError> {
        let _gate = self.commit_gate.read().await;
        let guest = self.get_guest_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut g = guest.write().await;
        if !self.is_committed_guest(&id, &guest) {
            return Err(EngineError::NotFound(id));
        }

        let first_name = patch.first_name.unwrap_or_else(|| g.first_name.clone());
        let last_name = patch.last_name.unwrap_or_else(|| g.last_name.clone());
        validate_first_name(&first_name)?;
        validate_last_name(last_name.as_deref())?;
        if first_name == g.first_name && last_name == g.last_name {
            return Ok(self.unchanged());
        }

        let event = Event::GuestUpdated {
            id,
            first_name: first_name.clone(),
            last_name: last_name.clone(),
            at: now,
        };
        self.wal_append(&event).await?;
        g.first_name = first_name;
        g.last_name = last_name;
        g.updated_at = now;
        Ok(self.committed())
    }

    pub async fn create_room(
        &self,
        id: Ulid,
        number: String,
        now: DateTime<Utc>,
    ) -> Result<Commit, EngineError> {
        validate_room_number(&number)?;
        let _gate = self.commit_gate.read().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        self.claim_room_number(&number, id)?;

        let room = Room {
            id,
            number: number.clone(),
            created_at: now,
            updated_at: now,
        };
        let rs = Arc::new(RwLock::new(RoomState::new(room)));
        let _pending = rs.clone().write_owned().await;
        let inserted = match self.rooms.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(rs);
                true
            }
        };
        if !inserted {
            self.room_numbers.remove(&number);
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomCreated {
            id,
            number: number.clone(),
            at: now,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.rooms.remove(&id);
            self.room_numbers.remove(&number);
            return Err(e);
        }
        Ok(self.committed())
    }

    pub async fn update_room(
        &self,
        id: Ulid,
        number: String,
        now: DateTime<Utc>,
    ) -> Result<Commit, EngineError> {
        validate_room_number(&number)?;
        let _gate = self.commit_gate.read().await;
        let rs = self.get_room_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if !self.is_committed_room(&id, &rs) {
            return Err(EngineError::NotFound(id));
        }
        if guard.room.number == number {
            return Ok(self.unchanged());
        }
        self.claim_room_number(&number, id)?;

        let event = Event::RoomUpdated {
            id,
            number: number.clone(),
            at: now,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.room_numbers.remove(&number);
            return Err(e);
        }
        self.room_numbers.remove(&guard.room.number);
        guard.room.number = number;
        guard.room.updated_at = now;
        Ok(self.committed())
    }

    fn claim_room_number(&self, number: &str, id: Ulid) -> Result<(), EngineError> {
        match self.room_numbers.entry(number.to_string()) {
            Entry::Occupied(_) => Err(EngineError::DuplicateRoomNumber(number.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }

    /// Book a room. The room's write lock is held from the availability check
    /// until the reservation is in the index, so two overlapping requests for
    /// the same room serialize and the second sees the first.
    pub async fn create_reservation(
        &self,
        new: NewReservation,
        now: DateTime<Utc>,
    ) -> Result<Commit, EngineError> {
        let stay = validate_stay(new.arrival, new.departure)?;
        let transition = apply_status_transition(None, new.status, now)?;
        let _gate = self.commit_gate.read().await;
        self.committed_guest(&new.guest_id).await?;

        let rs = self
            .get_room_state(&new.room_id)
            .ok_or(EngineError::NotFound(new.room_id))?;
        let mut guard = rs.write().await;
        if !self.is_committed_room(&new.room_id, &rs) {
            return Err(EngineError::NotFound(new.room_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }
        conflict_counted(check_availability(&guard, &stay, Some(new.id)))?;

        let claimed = match self.reservation_to_room.entry(new.id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(new.room_id);
                true
            }
        };
        if !claimed {
            return Err(EngineError::AlreadyExists(new.id));
        }

        let event = Event::ReservationCreated {
            id: new.id,
            guest_id: new.guest_id,
            room_id: new.room_id,
            arrival: new.arrival,
            departure: new.departure,
            at: now,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.reservation_to_room.remove(&new.id);
            return Err(e);
        }
        guard.insert_reservation(Reservation {
            id: new.id,
            guest_id: new.guest_id,
            room_id: new.room_id,
            arrival: new.arrival,
            departure: new.departure,
            status: transition.status,
            checkin_at: None,
            checkout_at: None,
            created_at: now,
            updated_at: now,
        });
        Ok(self.committed())
    }

    /// Change a reservation's status, guest or room.
    ///
    /// The status read, the transition decision and the write all happen under
    /// the room's write lock. Moving to another room locks both rooms in id
    /// order and checks availability on the target.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        now: DateTime<Utc>,
    ) -> Result<Commit, EngineError> {
        let _gate = self.commit_gate.read().await;
        loop {
            let source_id = self
                .room_for_reservation(&id)
                .ok_or(EngineError::NotFound(id))?;
            let target_id = patch.room_id.unwrap_or(source_id);

            if target_id == source_id {
                let (_, mut guard) = self.lock_reservation_room(&id).await?;
                if guard.id() != source_id {
                    // Moved while we waited; recompute the target.
                    metrics::counter!(LOCK_RETRIES_TOTAL).increment(1);
                    continue;
                }
                let Some(current) = guard.get(id).cloned() else {
                    continue;
                };
                let Some(next) = self.next_reservation(&current, &patch, now).await? else {
                    return Ok(self.unchanged());
                };
                self.wal_append(&update_event(&next)).await?;
                guard.replace_reservation(next);
                return Ok(self.committed());
            }

            let source = self
                .get_room_state(&source_id)
                .ok_or(EngineError::NotFound(source_id))?;
            let target = self
                .get_room_state(&target_id)
                .ok_or(EngineError::NotFound(target_id))?;
            let (mut src, mut dst) =
                lock_room_pair(source_id, source, target_id, target.clone()).await;
            if !self.is_committed_room(&target_id, &target) {
                return Err(EngineError::NotFound(target_id));
            }
            let Some(current) = src.get(id).cloned() else {
                debug!(reservation_id = %id, "reservation moved while locking, retrying");
                metrics::counter!(LOCK_RETRIES_TOTAL).increment(1);
                continue;
            };
            let Some(next) = self.next_reservation(&current, &patch, now).await? else {
                return Ok(self.unchanged());
            };
            if dst.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many reservations on room"));
            }
            conflict_counted(check_availability(&dst, &current.stay(), Some(id)))?;

            self.wal_append(&update_event(&next)).await?;
            src.remove_reservation(id);
            dst.insert_reservation(next);
            self.reservation_to_room.insert(id, target_id);
            return Ok(self.committed());
        }
    }

    /// The record `patch` turns `current` into, or `None` for an accepted no-op.
    async fn next_reservation(
        &self,
        current: &Reservation,
        patch: &ReservationPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>, EngineError> {
        let arrival = patch.arrival.unwrap_or(current.arrival);
        let departure = patch.departure.unwrap_or(current.departure);
        if arrival > departure {
            return Err(EngineError::InvalidDateRange { arrival, departure });
        }
        if arrival != current.arrival {
            return Err(EngineError::ImmutableField("arrival"));
        }
        if departure != current.departure {
            return Err(EngineError::ImmutableField("departure"));
        }

        let guest_id = patch.guest_id.unwrap_or(current.guest_id);
        if guest_id != current.guest_id {
            self.committed_guest(&guest_id).await?;
        }
        let room_id = patch.room_id.unwrap_or(current.room_id);
        let transition = apply_status_transition(Some(current.status), patch.status, now)?;

        if transition.is_noop(current.status)
            && guest_id == current.guest_id
            && room_id == current.room_id
        {
            return Ok(None);
        }
        if !transition.is_noop(current.status) {
            metrics::counter!(
                STATUS_TRANSITIONS_TOTAL,
                "from" => current.status.as_str(),
                "to" => transition.status.as_str()
            )
            .increment(1);
        }

        Ok(Some(Reservation {
            guest_id,
            room_id,
            status: transition.status,
            checkin_at: current.checkin_at.or(transition.checkin_at),
            checkout_at: current.checkout_at.or(transition.checkout_at),
            updated_at: now,
            ..current.clone()
        }))
    }

    /// Rewrite the WAL with the events that recreate the current state.
    /// Writers are held off for the duration so the snapshot matches the log.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let guests: Vec<_> = self.guests.iter().map(|e| e.value().clone()).collect();
        for guest in guests {
            let g = guest.read().await;
            events.push(Event::GuestCreated {
                id: g.id,
                first_name: g.first_name.clone(),
                last_name: g.last_name.clone(),
                at: g.created_at,
            });
            if g.updated_at != g.created_at {
                events.push(Event::GuestUpdated {
                    id: g.id,
                    first_name: g.first_name.clone(),
                    last_name: g.last_name.clone(),
                    at: g.updated_at,
                });
            }
        }

        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut reservation_events = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                id: guard.room.id,
                number: guard.room.number.clone(),
                at: guard.room.created_at,
            });
            if guard.room.updated_at != guard.room.created_at {
                events.push(Event::RoomUpdated {
                    id: guard.room.id,
                    number: guard.room.number.clone(),
                    at: guard.room.updated_at,
                });
            }
            for r in &guard.reservations {
                reservation_events.push(Event::ReservationCreated {
                    id: r.id,
                    guest_id: r.guest_id,
                    room_id: r.room_id,
                    arrival: r.arrival,
                    departure: r.departure,
                    at: r.created_at,
                });
                if r.updated_at != r.created_at {
                    reservation_events.push(update_event(r));
                }
            }
        }
        events.extend(reservation_events);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        debug!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
