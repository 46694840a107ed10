//! Monotonic time for the dispatcher.
//!
//! All dispatcher timestamps are monotonic nanoseconds (`i64`), with
//! `i64::MAX` standing in for "never".  The dispatcher reads time through
//! the [`Clock`] trait so tests can step it manually.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Source of monotonic nanosecond timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Production clock, anchored at construction time.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// Manually stepped clock for deterministic timeout and key-repeat tests.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert a wakeup deadline into a poll timeout in milliseconds.
///
/// Deadlines beyond `i32::MAX` milliseconds (including the "never" value)
/// become an infinite timeout (-1); deadlines in the past clamp to zero.
pub fn poll_timeout_millis(now: i64, next_wakeup: i64) -> i32 {
    if next_wakeup == i64::MAX {
        return -1;
    }
    let millis = (next_wakeup.saturating_sub(now)) / 1_000_000;
    if millis > i32::MAX as i64 {
        -1
    } else if millis > 0 {
        millis as i32
    } else {
        0
    }
}

/// Nanosecond delta as fractional milliseconds, for latency reporting.
pub fn nanos_to_millis(nanos: i64) -> f64 {
    nanos as f64 / 1_000_000.0
}
