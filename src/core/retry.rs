//! Retry policy for tasks.
//!
//! A policy is a retry limit plus a fixed delay. A task with `retries = k`
//! is attempted at most `k + 1` times.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often, and how far apart, a failing task is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (0 = never retry).
    pub retries: u32,

    /// Fixed delay between a failed attempt and the next one.
    #[serde(rename = "retry_delay_secs", with = "serde_duration")]
    pub delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }

    /// Retry up to `retries` times, waiting `delay` between attempts.
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    pub fn is_enabled(&self) -> bool {
        self.retries > 0
    }

    /// Whether another attempt is allowed after `attempts` attempts have
    /// already been made and the last one failed.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.retries
    }

    /// Total number of attempts this policy permits.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Durations are written as whole seconds in pipeline files.
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
