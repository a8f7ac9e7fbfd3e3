mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;

pub use conflict::check_availability;
pub use error::{EngineError, TransitionError};
pub use lifecycle::{apply_status_transition, Transition};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;
pub type SharedGuest = Arc<RwLock<Guest>>;

/// Success signal returned by every engine write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    /// Engine commit sequence number once this write is visible.
    pub seq: u64,
    /// False when the write was an accepted no-op and nothing was persisted.
    pub changed: bool,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that queue up while one batch is
/// being written share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch leaks into the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, &mut vec![(event, response)]),
    }
}

/// The transactional record store: guests, rooms, and each room's interval
/// index of reservations, made durable by the WAL.
///
/// Every room sits behind its own `RwLock`; a reservation write holds the write
/// lock of the room(s) it touches from the availability check until the change
/// is applied. Records are inserted into the maps already write-locked, so a
/// reader that finds one blocks until its creating commit resolves.
pub struct Engine {
    pub(super) guests: DashMap<Ulid, SharedGuest>,
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) room_numbers: DashMap<String, Ulid>,
    /// Reverse lookup: reservation id → room id.
    pub(super) reservation_to_room: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared; compaction holds it exclusively.
    pub(super) commit_gate: RwLock<()>,
    commit_seq: AtomicU64,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            guests: DashMap::new(),
            rooms: DashMap::new(),
            room_numbers: DashMap::new(),
            reservation_to_room: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            commit_seq: AtomicU64::new(0),
        };
        for event in &events {
            engine.replay_event(event)?;
        }
        Ok(engine)
    }

    /// Apply a replayed event. We are the sole owner of every lock here, so
    /// `try_write` never contends. Blocking lock calls are off limits because
    /// this may run inside an async context.
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: contended lock");
        match event {
            Event::GuestCreated { id, first_name, last_name, at } => {
                let guest = Guest {
                    id: *id,
                    first_name: first_name.clone(),
                    last_name: last_name.clone(),
                    created_at: *at,
                    updated_at: *at,
                };
                self.guests.insert(*id, Arc::new(RwLock::new(guest)));
            }
            Event::GuestUpdated { id, first_name, last_name, at } => {
                let Some(guest) = self.get_guest_state(id) else {
                    warn!(guest_id = %id, "replay: update for unknown guest");
                    return Ok(());
                };
                let mut g = guest.try_write().map_err(|_| contended())?;
                g.first_name = first_name.clone();
                g.last_name = last_name.clone();
                g.updated_at = *at;
            }
            Event::RoomCreated { id, number, at } => {
                let room = Room {
                    id: *id,
                    number: number.clone(),
                    created_at: *at,
                    updated_at: *at,
                };
                self.rooms.insert(*id, Arc::new(RwLock::new(RoomState::new(room))));
                self.room_numbers.insert(number.clone(), *id);
            }
            Event::RoomUpdated { id, number, at } => {
                let Some(rs) = self.get_room_state(id) else {
                    warn!(room_id = %id, "replay: update for unknown room");
                    return Ok(());
                };
                let mut guard = rs.try_write().map_err(|_| contended())?;
                self.room_numbers.remove(&guard.room.number);
                self.room_numbers.insert(number.clone(), *id);
                guard.room.number = number.clone();
                guard.room.updated_at = *at;
            }
            Event::ReservationCreated { id, guest_id, room_id, arrival, departure, at } => {
                let Some(rs) = self.get_room_state(room_id) else {
                    warn!(reservation_id = %id, room_id = %room_id, "replay: reservation for unknown room");
                    return Ok(());
                };
                let mut guard = rs.try_write().map_err(|_| contended())?;
                guard.insert_reservation(Reservation {
                    id: *id,
                    guest_id: *guest_id,
                    room_id: *room_id,
                    arrival: *arrival,
                    departure: *departure,
                    status: Status::Pending,
                    checkin_at: None,
                    checkout_at: None,
                    created_at: *at,
                    updated_at: *at,
                });
                self.reservation_to_room.insert(*id, *room_id);
            }
            Event::ReservationUpdated { id, room_id, .. } => {
                let source_id = match self.room_for_reservation(id) {
                    Some(source_id) => source_id,
                    None => {
                        warn!(reservation_id = %id, "replay: update for unknown reservation");
                        return Ok(());
                    }
                };
                let (Some(source), Some(target)) =
                    (self.get_room_state(&source_id), self.get_room_state(room_id))
                else {
                    warn!(reservation_id = %id, "replay: update references unknown room");
                    return Ok(());
                };
                let mut src = source.try_write().map_err(|_| contended())?;
                let Some(current) = src.get(*id).cloned() else {
                    return Ok(());
                };
                let next = updated_from_event(&current, event);
                if source_id == *room_id {
                    src.replace_reservation(next);
                } else {
                    let mut dst = target.try_write().map_err(|_| contended())?;
                    src.remove_reservation(*id);
                    dst.insert_reservation(next);
                    self.reservation_to_room.insert(*id, *room_id);
                }
            }
        }
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Sequence number of the latest visible commit.
    pub fn commit_seq(&self) -> u64 {
        self.commit_seq.load(Ordering::SeqCst)
    }

    /// Publish a commit. Call after the change is applied, while its locks are held.
    pub(super) fn committed(&self) -> Commit {
        Commit {
            seq: self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1,
            changed: true,
        }
    }

    pub(super) fn unchanged(&self) -> Commit {
        Commit {
            seq: self.commit_seq(),
            changed: false,
        }
    }

    pub fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn get_guest_state(&self, id: &Ulid) -> Option<SharedGuest> {
        self.guests.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_reservation(&self, id: &Ulid) -> Option<Ulid> {
        self.reservation_to_room.get(id).map(|e| *e.value())
    }

    /// True once `rs` is known to be the committed state for `id`. Only
    /// meaningful after acquiring `rs`'s lock.
    pub(super) fn is_committed_room(&self, id: &Ulid, rs: &SharedRoomState) -> bool {
        self.rooms.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), rs))
    }

    pub(super) fn is_committed_guest(&self, id: &Ulid, guest: &SharedGuest) -> bool {
        self.guests.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), guest))
    }

    /// Read a guest whose creation has committed.
    pub(super) async fn committed_guest(&self, id: &Ulid) -> Result<Guest, EngineError> {
        let guest = self.get_guest_state(id).ok_or(EngineError::NotFound(*id))?;
        let snapshot = guest.read().await.clone();
        if !self.is_committed_guest(id, &guest) {
            return Err(EngineError::NotFound(*id));
        }
        Ok(snapshot)
    }

    /// Write-lock the room holding `reservation_id`. A concurrent reassignment
    /// can move the reservation while we wait, so the lookup restarts until the
    /// locked room actually holds it.
    pub(super) async fn lock_reservation_room(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        loop {
            let room_id = self
                .room_for_reservation(reservation_id)
                .ok_or(EngineError::NotFound(*reservation_id))?;
            let rs = self
                .get_room_state(&room_id)
                .ok_or(EngineError::NotFound(room_id))?;
            let guard = rs.write_owned().await;
            if guard.get(*reservation_id).is_some() {
                return Ok((room_id, guard));
            }
            metrics::counter!(crate::observability::LOCK_RETRIES_TOTAL).increment(1);
        }
    }
}

/// Lock two distinct rooms in ascending id order. Returns `(a, b)` guards.
pub(super) async fn lock_room_pair(
    a_id: Ulid,
    a: SharedRoomState,
    b_id: Ulid,
    b: SharedRoomState,
) -> (OwnedRwLockWriteGuard<RoomState>, OwnedRwLockWriteGuard<RoomState>) {
    debug_assert_ne!(a_id, b_id);
    if a_id < b_id {
        let ga = a.write_owned().await;
        let gb = b.write_owned().await;
        (ga, gb)
    } else {
        let gb = b.write_owned().await;
        let ga = a.write_owned().await;
        (ga, gb)
    }
}

pub(super) fn update_event(r: &Reservation) -> Event {
    Event::ReservationUpdated {
        id: r.id,
        guest_id: r.guest_id,
        room_id: r.room_id,
        status: r.status,
        checkin_at: r.checkin_at,
        checkout_at: r.checkout_at,
        at: r.updated_at,
    }
}

fn updated_from_event(current: &Reservation, event: &Event) -> Reservation {
    let mut next = current.clone();
    if let Event::ReservationUpdated {
        guest_id,
        room_id,
        status,
        checkin_at,
        checkout_at,
        at,
        ..
    } = event
    {
        next.guest_id = *guest_id;
        next.room_id = *room_id;
        next.status = *status;
        next.checkin_at = *checkin_at;
        next.checkout_at = *checkout_at;
        next.updated_at = *at;
    }
    next
}
