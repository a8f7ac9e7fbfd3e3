use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::model::Status;
use crate::observability::{
    CACHE_ENTRIES, CACHE_REFRESH_DURATION_SECONDS, CACHE_REFRESH_FAILURES_TOTAL,
    CACHE_REFRESHES_TOTAL, CACHE_TRIGGERS_COALESCED_TOTAL,
};

/// Pending triggers beyond the first add nothing: one refresh covers them all.
const TRIGGER_QUEUE: usize = 64;

/// One row of the projection: a reservation joined with its guest's name and
/// its room's number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpcomingEntry {
    pub reservation_id: Ulid,
    pub guest_id: Ulid,
    pub room_id: Ulid,
    pub first_name: String,
    pub last_name: Option<String>,
    pub room_number: String,
    pub arrival: NaiveDate,
    pub departure: NaiveDate,
    pub status: Status,
    pub checkin_at: Option<DateTime<Utc>>,
    pub checkout_at: Option<DateTime<Utc>>,
}

/// An immutable snapshot of the projection.
#[derive(Debug, Clone, Default)]
pub struct UpcomingView {
    /// Successful refreshes so far. Zero until the first one lands.
    pub generation: u64,
    /// Every commit with a sequence number ≤ `as_of` is reflected.
    pub as_of: u64,
    pub today: Option<NaiveDate>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub entries: Vec<UpcomingEntry>,
}

/// Stays already under way, plus arrivals less than `horizon_days` away.
/// A stay departing today still counts.
pub fn is_current_or_upcoming(
    arrival: NaiveDate,
    departure: NaiveDate,
    today: NaiveDate,
    horizon_days: i64,
) -> bool {
    departure >= today && (arrival <= today || (arrival - today).num_days() < horizon_days)
}

/// Where a refresh reads its rows from.
#[async_trait]
pub trait ProjectionSource: Send + Sync {
    /// Latest commit sequence. Read before the snapshot starts.
    fn commit_seq(&self) -> u64;

    async fn upcoming_entries(
        &self,
        today: NaiveDate,
        horizon_days: i64,
    ) -> Result<Vec<UpcomingEntry>, EngineError>;
}

#[async_trait]
impl ProjectionSource for Engine {
    fn commit_seq(&self) -> u64 {
        Engine::commit_seq(self)
    }

    async fn upcoming_entries(
        &self,
        today: NaiveDate,
        horizon_days: i64,
    ) -> Result<Vec<UpcomingEntry>, EngineError> {
        Ok(Engine::upcoming_entries(self, today, horizon_days).await)
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Write(Ulid),
    Reconcile,
}

struct Shared {
    view_tx: watch::Sender<Arc<UpcomingView>>,
    stale: AtomicBool,
}

/// The current-and-upcoming reservations view.
///
/// Writers only enqueue a trigger; a single background task recomputes the
/// whole view and publishes it with one pointer swap.
pub struct UpcomingCache {
    shared: Arc<Shared>,
    trigger_tx: mpsc::Sender<Trigger>,
}

impl UpcomingCache {
    /// Start the refresher task and queue the initial build.
    pub fn spawn(
        source: Arc<dyn ProjectionSource>,
        clock: Arc<dyn Clock>,
        horizon_days: i64,
    ) -> Arc<Self> {
        let (view_tx, _) = watch::channel(Arc::new(UpcomingView::default()));
        let shared = Arc::new(Shared {
            view_tx,
            stale: AtomicBool::new(true),
        });
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
        tokio::spawn(refresh_loop(
            shared.clone(),
            source,
            clock,
            horizon_days,
            trigger_rx,
        ));
        let cache = Arc::new(Self { shared, trigger_tx });
        cache.request_reconcile();
        cache
    }

    /// Fire-and-forget refresh request after a committed write.
    pub fn schedule_refresh(&self, reservation_id: Ulid) {
        self.enqueue(Trigger::Write(reservation_id));
    }

    pub fn request_reconcile(&self) {
        self.enqueue(Trigger::Reconcile);
    }

    fn enqueue(&self, trigger: Trigger) {
        match self.trigger_tx.try_send(trigger) {
            Ok(()) => {}
            // A queued trigger will read state at least as new as ours.
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!(CACHE_TRIGGERS_COALESCED_TOTAL).increment(1);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(?trigger, "upcoming refresher is gone, dropping trigger");
            }
        }
    }

    pub fn current(&self) -> Arc<UpcomingView> {
        self.shared.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<UpcomingView>> {
        self.shared.view_tx.subscribe()
    }

    /// True until the first refresh succeeds, and after any refresh fails.
    pub fn is_stale(&self) -> bool {
        self.shared.stale.load(Ordering::Acquire)
    }

    /// Wait for a view that reflects commit `seq`.
    pub async fn wait_fresh(&self, seq: u64) -> Arc<UpcomingView> {
        let mut rx = self.subscribe();
        match rx.wait_for(|v| v.generation > 0 && v.as_of >= seq).await {
            Ok(view) => view.clone(),
            Err(_) => self.current(),
        }
    }
}

async fn refresh_loop(
    shared: Arc<Shared>,
    source: Arc<dyn ProjectionSource>,
    clock: Arc<dyn Clock>,
    horizon_days: i64,
    mut rx: mpsc::Receiver<Trigger>,
) {
    while let Some(first) = rx.recv().await {
        let mut coalesced = 0u64;
        while rx.try_recv().is_ok() {
            coalesced += 1;
        }
        if coalesced > 0 {
            metrics::counter!(CACHE_TRIGGERS_COALESCED_TOTAL).increment(coalesced);
        }
        if let Trigger::Write(reservation_id) = first {
            debug!(reservation_id = %reservation_id, coalesced, "refreshing upcoming view");
        }
        refresh_once(&shared, source.as_ref(), clock.as_ref(), horizon_days).await;
    }
}

async fn refresh_once(
    shared: &Shared,
    source: &dyn ProjectionSource,
    clock: &dyn Clock,
    horizon_days: i64,
) {
    let start = Instant::now();
    let now = clock.now();
    let today = now.date_naive();
    let as_of = source.commit_seq();
    match source.upcoming_entries(today, horizon_days).await {
        Ok(entries) => {
            let generation = shared.view_tx.borrow().generation + 1;
            let count = entries.len();
            shared.view_tx.send_replace(Arc::new(UpcomingView {
                generation,
                as_of,
                today: Some(today),
                refreshed_at: Some(now),
                entries,
            }));
            shared.stale.store(false, Ordering::Release);
            metrics::counter!(CACHE_REFRESHES_TOTAL).increment(1);
            metrics::gauge!(CACHE_ENTRIES).set(count as f64);
            metrics::histogram!(CACHE_REFRESH_DURATION_SECONDS)
                .record(start.elapsed().as_secs_f64());
            info!(generation, as_of, entries = count, %today, "upcoming view refreshed");
        }
        Err(e) => {
            shared.stale.store(true, Ordering::Release);
            metrics::counter!(CACHE_REFRESH_FAILURES_TOTAL).increment(1);
            warn!(error = %e, as_of, "upcoming view refresh failed, keeping previous view");
        }
    }
}
