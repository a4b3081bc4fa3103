//! Crash-loop detection policy.
//!
//! The engine performs automatic restarts (`on-failure`, bounded); this
//! policy only counts unexpected deaths and decides when the budget is
//! exhausted. Pure so the window arithmetic is table-testable.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
pub struct CrashPolicy {
    /// Window W: deaths older than this stop counting.
    pub window: Duration,
    /// Threshold K: deaths within W that latch the service.
    pub threshold: u32,
}

impl CrashPolicy {
    pub fn from_config(config: &crate::config::CrashLoopConfig) -> CrashPolicy {
        CrashPolicy {
            window: Duration::seconds(config.window_secs),
            threshold: config.threshold,
        }
    }
}

impl Default for CrashPolicy {
    fn default() -> Self {
        CrashPolicy {
            window: Duration::minutes(10),
            threshold: 5,
        }
    }
}

/// Outcome of observing one unexpected `die` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashVerdict {
    pub restart_count: i64,
    pub window_start: DateTime<Utc>,
    /// `true` once `restart_count >= K` within W: latch the service.
    pub latched: bool,
}

/// Advance the `(restart_count, window_start)` pair for a death observed
/// at `now`. A null or expired window resets the count to 1.
pub fn observe_die(
    restart_count: i64,
    window_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: CrashPolicy,
) -> CrashVerdict {
    let (count, start) = match window_start {
        Some(start) if now - start <= policy.window => (restart_count + 1, start),
        _ => (1, now),
    };
    CrashVerdict {
        restart_count: count,
        window_start: start,
        latched: count >= policy.threshold as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CrashPolicy {
        CrashPolicy {
            window: Duration::minutes(10),
            threshold: 5,
        }
    }

    #[test]
    fn first_death_opens_window() {
        let now = Utc::now();
        let verdict = observe_die(0, None, now, policy());
        assert_eq!(verdict.restart_count, 1);
        assert_eq!(verdict.window_start, now);
        assert!(!verdict.latched);
    }

    #[test]
    fn fifth_death_within_window_latches() {
        let start = Utc::now();
        let mut count = 0;
        let mut window = None;
        for i in 0..5 {
            let verdict = observe_die(count, window, start + Duration::seconds(i * 10), policy());
            count = verdict.restart_count;
            window = Some(verdict.window_start);
            if i < 4 {
                assert!(!verdict.latched, "latched too early at death {}", i + 1);
            } else {
                assert!(verdict.latched);
            }
        }
        assert_eq!(count, 5);
        assert_eq!(window, Some(start));
    }

    #[test]
    fn expired_window_resets_count() {
        let start = Utc::now();
        let verdict = observe_die(4, Some(start), start + Duration::minutes(11), policy());
        assert_eq!(verdict.restart_count, 1);
        assert_eq!(verdict.window_start, start + Duration::minutes(11));
        assert!(!verdict.latched);
    }

    #[test]
    fn death_exactly_at_window_edge_still_counts() {
        let start = Utc::now();
        let verdict = observe_die(4, Some(start), start + Duration::minutes(10), policy());
        assert_eq!(verdict.restart_count, 5);
        assert!(verdict.latched);
    }

    #[test]
    fn threshold_one_latches_immediately() {
        let tight = CrashPolicy {
            window: Duration::minutes(10),
            threshold: 1,
        };
        let verdict = observe_die(0, None, Utc::now(), tight);
        assert!(verdict.latched);
    }
}
