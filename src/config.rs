//! Dispatcher configuration.

use std::time::Duration;

/// Tunables for the dispatcher service and its default policy.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delay before the first synthetic key repeat and between repeats.
    pub key_repeat_timeout: Duration,
    /// How long a consumer may sit on a dispatched event before it is
    /// declared not responding.
    pub target_timeout: Duration,
    /// Motion samples a channel's staging buffer holds at once.
    pub staging_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            key_repeat_timeout: Duration::from_millis(500),
            target_timeout: Duration::from_secs(5),
            staging_capacity: 16,
        }
    }
}

impl DispatcherConfig {
    /// Key repeat timeout in the nanosecond timebase the policy reports.
    pub fn key_repeat_timeout_nanos(&self) -> i64 {
        self.key_repeat_timeout.as_nanos() as i64
    }
}
