//! Window strategies: mapping a point in time onto a counting bucket.
//!
//! Fixed windows align to multiples of the window duration since the Unix
//! epoch. Every instance computes the same bucket for the same instant, and a
//! single atomic counter per bucket is enough. The price is that a caller can
//! spend a full quota at the end of one window and another at the start of
//! the next, bursting up to `2 x max` across a boundary. That behavior is kept
//! on purpose; policies that cannot tolerate it use [`WindowStrategy::SlidingLog`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::clock::epoch_millis;

/// Longest window a policy may use.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 86400);

/// Time unit for window durations in policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// How requests are grouped in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStrategy {
    /// Aligned buckets of `floor(t / W)`, one counter per bucket.
    #[default]
    FixedWindow,
    /// Timestamp log over the interval `(t - W, t]`.
    SlidingLog,
}

/// The bucket a request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSlot {
    /// Window identifier. `None` for sliding logs, which have a single
    /// continuously trimmed bucket per key.
    pub id: Option<i64>,
    /// Time left until the bucket resets. Used as the counter TTL.
    pub ttl: Duration,
    /// When the quota is next guaranteed to have room again.
    pub reset_at: DateTime<Utc>,
}

impl WindowStrategy {
    /// Compute the slot for time `now` and window duration `window`.
    ///
    /// `window` must be non-zero and at most [`MAX_WINDOW`]; policies reject
    /// anything else at construction. Longer windows are clamped.
    pub fn compute(&self, now: DateTime<Utc>, window: Duration) -> WindowSlot {
        let window = window.min(MAX_WINDOW);
        let window_ms = window.as_millis().max(1) as i64;

        match self {
            WindowStrategy::FixedWindow => {
                let t = epoch_millis(now);
                let id = t.div_euclid(window_ms);
                let ttl_ms = window_ms - t.rem_euclid(window_ms);
                WindowSlot {
                    id: Some(id),
                    ttl: Duration::from_millis(ttl_ms as u64),
                    reset_at: after(now, ttl_ms),
                }
            }
            WindowStrategy::SlidingLog => WindowSlot {
                id: None,
                ttl: window,
                reset_at: after(now, window_ms),
            },
        }
    }
}

fn after(now: DateTime<Utc>, millis: i64) -> DateTime<Utc> {
    now.checked_add_signed(chrono::Duration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_fixed_window_same_bucket() {
        let window = Duration::from_secs(60);
        let a = WindowStrategy::FixedWindow.compute(at(0), window);
        let b = WindowStrategy::FixedWindow.compute(at(59), window);

        assert_eq!(a.id, Some(0));
        assert_eq!(a.id, b.id);
        assert_eq!(a.ttl, Duration::from_secs(60));
        assert_eq!(b.ttl, Duration::from_secs(1));
        assert_eq!(a.reset_at, at(60));
        assert_eq!(b.reset_at, at(60));
    }

    #[test]
    fn test_fixed_window_boundary() {
        let window = Duration::from_secs(3600);
        let before = WindowStrategy::FixedWindow.compute(at(3599), window);
        let after = WindowStrategy::FixedWindow.compute(at(3600), window);

        assert_eq!(before.id, Some(0));
        assert_eq!(after.id, Some(1));
        assert_eq!(before.ttl, Duration::from_secs(1));
        assert_eq!(after.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_fixed_window_sub_second_precision() {
        let window = Duration::from_secs(1);
        let t = at(10) + chrono::Duration::milliseconds(250);
        let slot = WindowStrategy::FixedWindow.compute(t, window);

        assert_eq!(slot.id, Some(10));
        assert_eq!(slot.ttl, Duration::from_millis(750));
    }

    #[test]
    fn test_sliding_log_has_no_bucket_id() {
        let window = Duration::from_secs(60);
        let slot = WindowStrategy::SlidingLog.compute(at(30), window);

        assert_eq!(slot.id, None);
        assert_eq!(slot.ttl, window);
        assert_eq!(slot.reset_at, at(90));
    }

    #[test]
    fn test_oversized_window_is_clamped() {
        let huge = Duration::from_secs(4_000_000_000 * 86400);
        let fixed = WindowStrategy::FixedWindow.compute(at(30), huge);
        let sliding = WindowStrategy::SlidingLog.compute(at(30), huge);

        assert_eq!(fixed.id, Some(0));
        assert!(fixed.ttl <= MAX_WINDOW);
        assert_eq!(sliding.ttl, MAX_WINDOW);
        assert!(sliding.reset_at > at(30));
    }

    #[test]
    fn test_reset_near_end_of_time_saturates() {
        let slot = WindowStrategy::SlidingLog.compute(DateTime::<Utc>::MAX_UTC, Duration::from_secs(60));
        assert_eq!(slot.reset_at, DateTime::<Utc>::MAX_UTC);
    }
}
