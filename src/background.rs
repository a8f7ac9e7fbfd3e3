use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::engine::Engine;
use crate::observability::THROTTLE_KEYS;
use crate::throttle::StatusThrottle;
use crate::upcoming::UpcomingCache;

const MIN_TICK: Duration = Duration::from_millis(1);

/// `tokio::time::interval` rejects a zero period.
fn ticker(every: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(every.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Why the reconciler should rebuild the upcoming view now, if it should.
fn reconcile_reason(
    stale: bool,
    view_today: Option<NaiveDate>,
    today: NaiveDate,
    since_last: Duration,
    every: Duration,
) -> Option<&'static str> {
    if stale {
        Some("stale")
    } else if view_today.is_some_and(|d| d != today) {
        Some("day rollover")
    } else if since_last >= every {
        Some("interval")
    } else {
        None
    }
}

/// Keeps the upcoming view honest without any writes: retries failed
/// refreshes, rebuilds when the date changes, and refreshes every `every`.
pub async fn run_reconciler(cache: Arc<UpcomingCache>, clock: Arc<dyn Clock>, every: Duration) {
    let mut ticker = ticker(every.min(Duration::from_secs(1)));
    let mut last = Instant::now();
    loop {
        ticker.tick().await;
        let today = clock.now().date_naive();
        let view_today = cache.current().today;
        if let Some(reason) =
            reconcile_reason(cache.is_stale(), view_today, today, last.elapsed(), every)
        {
            debug!(reason, "reconciling upcoming view");
            cache.request_reconcile();
            last = Instant::now();
        }
    }
}

/// Drop throttle state whose window has fully passed.
pub async fn run_throttle_purge(
    throttle: Arc<StatusThrottle>,
    clock: Arc<dyn Clock>,
    every: Duration,
) {
    let mut ticker = ticker(every);
    loop {
        ticker.tick().await;
        let dropped = throttle.purge_expired(clock.now_ms());
        metrics::gauge!(THROTTLE_KEYS).set(throttle.tracked() as f64);
        if dropped > 0 {
            debug!(dropped, tracked = throttle.tracked(), "purged throttle state");
        }
    }
}

/// Compact the WAL once `threshold` appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut ticker = ticker(every);
    loop {
        ticker.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => error!(error = %e, "WAL compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ulid::Ulid;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn reconcile_reasons() {
        let minute = Duration::from_secs(60);
        let today = d("2018-02-01");
        let fresh = Duration::from_secs(5);
        assert_eq!(reconcile_reason(true, Some(today), today, fresh, minute), Some("stale"));
        assert_eq!(
            reconcile_reason(false, Some(d("2018-01-31")), today, fresh, minute),
            Some("day rollover")
        );
        assert_eq!(reconcile_reason(false, Some(today), today, minute, minute), Some("interval"));
        assert_eq!(reconcile_reason(false, Some(today), today, fresh, minute), None);
    }

    #[tokio::test]
    async fn zero_periods_keep_tasks_alive() {
        use crate::clock::ManualClock;

        let dir = std::env::temp_dir().join("innkeep_test_background");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("zero_period.wal");
        let _ = std::fs::remove_file(&path);

        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let cache = UpcomingCache::spawn(engine.clone(), clock.clone(), 3);
        let throttle = Arc::new(StatusThrottle::new(1, Duration::ZERO));

        let tasks = [
            tokio::spawn(run_reconciler(cache, clock.clone(), Duration::ZERO)),
            tokio::spawn(run_throttle_purge(throttle, clock, Duration::ZERO)),
            tokio::spawn(run_compactor(engine, 1000, Duration::ZERO)),
        ];
        tokio::time::sleep(Duration::from_millis(50)).await;
        for task in &tasks {
            assert!(!task.is_finished());
        }
        for task in tasks {
            task.abort();
        }
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn compactor_runs_past_threshold() {
        let dir = std::env::temp_dir().join("innkeep_test_background");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("compactor.wal");
        let _ = std::fs::remove_file(&path);

        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        for i in 0..6 {
            engine
                .create_room(Ulid::new(), format!("{}", 100 + i), Utc::now())
                .await
                .unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 6);

        let task = tokio::spawn(run_compactor(engine.clone(), 5, Duration::from_millis(10)));
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.wal_appends_since_compact().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        task.abort();

        drop(engine);
        let reopened = Engine::new(path.clone()).unwrap();
        assert_eq!(reopened.room_count(), 6);
        let _ = std::fs::remove_file(&path);
    }
}
