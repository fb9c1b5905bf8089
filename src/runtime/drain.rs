//! Connection draining policy.
//!
//! During shutdown the server repeatedly scans its live connections and
//! closes the ones that are closable, sleeping between scans on an
//! exponentially growing, jittered interval.

use crate::runtime::ConnState;
use rand::Rng;
use std::time::Duration;

/// How long a connection may sit in `New` before draining treats it as idle.
pub const STALE_NEW_AFTER: Duration = Duration::from_secs(5);

/// First poll interval of a drain.
pub const POLL_INTERVAL_BASE: Duration = Duration::from_millis(1);

/// Poll interval ceiling.
pub const POLL_INTERVAL_MAX: Duration = Duration::from_millis(500);

/// Drain tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    pub poll_interval_base: Duration,
    pub poll_interval_max: Duration,
    pub stale_new_after: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            poll_interval_base: POLL_INTERVAL_BASE,
            poll_interval_max: POLL_INTERVAL_MAX,
            stale_new_after: STALE_NEW_AFTER,
        }
    }
}

impl DrainPolicy {
    /// Whether a connection last seen as `(state, unix_sec)` may be closed at
    /// `now`.
    ///
    /// An unstamped connection (`unix_sec == 0`) is never closable.
    pub fn is_closable(&self, state: ConnState, unix_sec: u64, now: u64) -> bool {
        if unix_sec == 0 {
            return false;
        }
        match state {
            ConnState::Idle | ConnState::Closed => true,
            ConnState::New => {
                unix_sec < now.saturating_sub(self.stale_new_after.as_secs())
            }
        }
    }

    pub fn backoff(&self) -> PollBackoff {
        PollBackoff::new(self.poll_interval_base, self.poll_interval_max)
    }
}

/// Doubling poll interval with up to 10% added jitter.
#[derive(Debug)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Interval to wait before the next scan.
    pub fn next_interval(&mut self) -> Duration {
        let jitter_ceiling = (self.base.as_nanos() / 10) as u64;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        let interval = self.base + Duration::from_nanos(jitter);

        self.base = (self.base * 2).min(self.max);
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn test_idle_is_closable() {
        let policy = DrainPolicy::default();
        assert!(policy.is_closable(ConnState::Idle, NOW, NOW));
        assert!(policy.is_closable(ConnState::Idle, NOW - 100, NOW));
    }

    #[test]
    fn test_fresh_new_is_not_closable() {
        let policy = DrainPolicy::default();
        assert!(!policy.is_closable(ConnState::New, NOW, NOW));
        assert!(!policy.is_closable(ConnState::New, NOW - 5, NOW));
    }

    #[test]
    fn test_stale_new_is_closable() {
        let policy = DrainPolicy::default();
        assert!(policy.is_closable(ConnState::New, NOW - 6, NOW));
    }

    #[test]
    fn test_unstamped_is_never_closable() {
        let policy = DrainPolicy::default();
        assert!(!policy.is_closable(ConnState::Idle, 0, NOW));
        assert!(!policy.is_closable(ConnState::New, 0, NOW));
    }

    #[test]
    fn test_stale_threshold_is_overridable() {
        let policy = DrainPolicy {
            stale_new_after: Duration::from_secs(60),
            ..DrainPolicy::default()
        };
        assert!(!policy.is_closable(ConnState::New, NOW - 30, NOW));
        assert!(policy.is_closable(ConnState::New, NOW - 61, NOW));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = PollBackoff::new(Duration::from_millis(1), Duration::from_millis(16));

        let mut expected_base = Duration::from_millis(1);
        for _ in 0..10 {
            let interval = backoff.next_interval();
            assert!(interval >= expected_base, "{interval:?} < {expected_base:?}");
            assert!(
                interval <= expected_base + expected_base / 10,
                "{interval:?} exceeds jitter bound of {expected_base:?}"
            );
            expected_base = (expected_base * 2).min(Duration::from_millis(16));
        }
    }

    #[test]
    fn test_default_backoff_reaches_ceiling() {
        let mut backoff = DrainPolicy::default().backoff();
        for _ in 0..20 {
            backoff.next_interval();
        }
        let interval = backoff.next_interval();
        assert!(interval >= POLL_INTERVAL_MAX);
        assert!(interval <= POLL_INTERVAL_MAX + POLL_INTERVAL_MAX / 10);
    }
}
