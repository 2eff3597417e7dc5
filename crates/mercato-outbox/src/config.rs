//! Poller configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Configuration for the outbox poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between poll cycles.
    pub poll_interval: Duration,
    /// Failed attempts tolerated before a handler is dead-lettered.
    pub max_retries: i32,
    /// Base of the exponential backoff, in seconds.
    pub exponential_backoff_base: f64,
    /// Rows fetched per poll cycle.
    pub batch_size: usize,
    /// Time between periodic acknowledgment flushes.
    pub batch_flush_interval: Duration,
    /// Buffered writes that trigger an immediate background flush.
    pub batch_size_threshold: usize,
    /// Deadline for a single handler invocation.
    pub handler_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_retries: 3,
            exponential_backoff_base: 2.0,
            batch_size: 100,
            batch_flush_interval: Duration::from_millis(100),
            batch_size_threshold: 50,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl PollerConfig {
    /// The retry policy these settings describe.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: self.exponential_backoff_base,
        }
    }
}
