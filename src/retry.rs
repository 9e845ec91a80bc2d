//! Retry thresholds for messages and backoff for broker reconnects.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many dead-letter round-trips a message may make before it is given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Checks if a message that has already been retried `retry_count` times
    /// may go around the loop once more.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    /// Five retries.
    fn default() -> Self {
        Self::new(5)
    }
}

/// Exponential backoff between reconnect attempts after the broker goes away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// `None` keeps reconnecting forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2,
            max_attempts: None,
        }
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Returns the delay before reconnect attempt `attempt` (0-indexed).
    /// Returns `None` once `max_attempts` is used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let factor = self.multiplier.max(1).checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    /// 5s doubling up to one minute, unbounded attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60))
    }
}
