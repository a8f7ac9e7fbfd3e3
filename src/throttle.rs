use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allow,
    RateLimited { retry_after: Duration },
}

/// Per-reservation sliding-log limiter for status-changing requests.
///
/// Keyed by the reservation being changed, never by the caller. Each key holds
/// the instants of the requests it let through in the current window.
pub struct StatusThrottle {
    limit: usize,
    window_ms: Ms,
    history: DashMap<Ulid, VecDeque<Ms>>,
}

impl StatusThrottle {
    /// `limit` accepted requests per `window`. A zero limit is treated as one.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1) as usize,
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            history: DashMap::new(),
        }
    }

    /// Decide whether a request for `reservation_id` may proceed, and record
    /// it if so. Requests without a status field always pass and leave no trace.
    pub fn check(&self, reservation_id: Ulid, includes_status: bool, now: Ms) -> ThrottleDecision {
        if !includes_status {
            return ThrottleDecision::Allow;
        }
        let mut log = self.history.entry(reservation_id).or_default();
        let horizon = now.saturating_sub(self.window_ms);
        while log.front().is_some_and(|&t| t <= horizon) {
            log.pop_front();
        }
        if log.len() >= self.limit {
            let oldest = log.front().copied().unwrap_or(now);
            let wait_ms = oldest.saturating_add(self.window_ms).saturating_sub(now).max(0);
            return ThrottleDecision::RateLimited {
                retry_after: Duration::from_millis(wait_ms as u64),
            };
        }
        log.push_back(now);
        ThrottleDecision::Allow
    }

    /// Drop every key whose recorded requests have all left the window.
    /// Returns how many keys were dropped.
    pub fn purge_expired(&self, now: Ms) -> usize {
        let horizon = now.saturating_sub(self.window_ms);
        let before = self.history.len();
        self.history
            .retain(|_, log| log.back().is_some_and(|&t| t > horizon));
        before.saturating_sub(self.history.len())
    }

    /// Number of reservations with live throttle state.
    pub fn tracked(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn second_status_change_within_window_is_limited() {
        let throttle = StatusThrottle::new(1, MINUTE);
        let id = Ulid::new();
        assert_eq!(throttle.check(id, true, 1_000), ThrottleDecision::Allow);
        assert_eq!(
            throttle.check(id, true, 31_000),
            ThrottleDecision::RateLimited {
                retry_after: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn window_expiry_allows_again() {
        let throttle = StatusThrottle::new(1, MINUTE);
        let id = Ulid::new();
        assert_eq!(throttle.check(id, true, 0), ThrottleDecision::Allow);
        assert!(matches!(
            throttle.check(id, true, 59_999),
            ThrottleDecision::RateLimited { .. }
        ));
        assert_eq!(throttle.check(id, true, 60_000), ThrottleDecision::Allow);
    }

    #[test]
    fn requests_without_status_bypass() {
        let throttle = StatusThrottle::new(1, MINUTE);
        let id = Ulid::new();
        assert_eq!(throttle.check(id, true, 0), ThrottleDecision::Allow);
        for t in 1..10 {
            assert_eq!(throttle.check(id, false, t), ThrottleDecision::Allow);
        }
        // Bypassed requests leave no trace: a fresh key stays untracked.
        let other = Ulid::new();
        throttle.check(other, false, 0);
        assert_eq!(throttle.tracked(), 1);
    }

    #[test]
    fn reservations_are_independent() {
        let throttle = StatusThrottle::new(1, MINUTE);
        let a = Ulid::new();
        let b = Ulid::new();
        assert_eq!(throttle.check(a, true, 0), ThrottleDecision::Allow);
        assert!(matches!(throttle.check(a, true, 1), ThrottleDecision::RateLimited { .. }));
        assert_eq!(throttle.check(b, true, 2), ThrottleDecision::Allow);
        assert!(matches!(throttle.check(a, true, 3), ThrottleDecision::RateLimited { .. }));
    }

    #[test]
    fn rejected_requests_are_not_recorded() {
        let throttle = StatusThrottle::new(1, MINUTE);
        let id = Ulid::new();
        throttle.check(id, true, 0);
        for t in (1_000..59_000).step_by(1_000) {
            assert!(matches!(throttle.check(id, true, t), ThrottleDecision::RateLimited { .. }));
        }
        // Only the first request counts, so the window still ends at 60s.
        assert_eq!(throttle.check(id, true, 60_000), ThrottleDecision::Allow);
    }

    #[test]
    fn higher_limit_uses_oldest_for_retry_after() {
        let throttle = StatusThrottle::new(3, MINUTE);
        let id = Ulid::new();
        for t in [0, 10_000, 20_000] {
            assert_eq!(throttle.check(id, true, t), ThrottleDecision::Allow);
        }
        assert_eq!(
            throttle.check(id, true, 25_000),
            ThrottleDecision::RateLimited {
                retry_after: Duration::from_secs(35)
            }
        );
        // The oldest slot frees up at 60s.
        assert_eq!(throttle.check(id, true, 60_000), ThrottleDecision::Allow);
    }

    #[test]
    fn zero_limit_behaves_as_one() {
        let throttle = StatusThrottle::new(0, MINUTE);
        let id = Ulid::new();
        assert_eq!(throttle.check(id, true, 0), ThrottleDecision::Allow);
        assert!(matches!(throttle.check(id, true, 1), ThrottleDecision::RateLimited { .. }));
    }

    #[test]
    fn purge_drops_only_expired_keys() {
        let throttle = StatusThrottle::new(1, MINUTE);
        let old = Ulid::new();
        let fresh = Ulid::new();
        throttle.check(old, true, 0);
        throttle.check(fresh, true, 50_000);
        assert_eq!(throttle.purge_expired(70_000), 1);
        assert_eq!(throttle.tracked(), 1);
        assert!(matches!(throttle.check(fresh, true, 70_000), ThrottleDecision::RateLimited { .. }));
        assert_eq!(throttle.check(old, true, 70_000), ThrottleDecision::Allow);
    }
}
