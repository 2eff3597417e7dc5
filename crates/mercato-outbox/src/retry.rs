//! Failure classification and exponential backoff.

use chrono::{DateTime, Duration, Utc};
use mercato_core::error::{FailureClass, HandlerError};

/// Longest delay a single backoff step may reach.
const MAX_BACKOFF_MS: f64 = 7.0 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Delay before the attempt that follows `retry_count` failed attempts:
/// `base^retry_count` seconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn backoff_delay(base: f64, retry_count: i32) -> Duration {
    let millis = (base.powi(retry_count) * 1000.0).clamp(0.0, MAX_BACKOFF_MS);
    Duration::milliseconds(millis.round() as i64)
}

/// When the next attempt is due.
#[must_use]
pub fn next_retry_at(now: DateTime<Utc>, base: f64, retry_count: i32) -> DateTime<Utc> {
    now + backoff_delay(base, retry_count)
}

/// What to do after a handler failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Record a dead letter and stop.
    DeadLetter,
    /// Try again at `next_retry_at` with the incremented count.
    Retry {
        /// The incremented retry count.
        retry_count: i32,
        /// When the next attempt is due.
        next_retry_at: DateTime<Utc>,
    },
}

/// Retry ceiling and backoff base.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before dead-lettering.
    pub max_retries: i32,
    /// Base of the exponential backoff, in seconds.
    pub backoff_base: f64,
}

impl RetryPolicy {
    /// Decides the fate of a handler whose attempt at `retry_count` failed.
    ///
    /// Permanent failures are dead-lettered at once, whatever the count.
    #[must_use]
    pub fn decide(&self, error: &HandlerError, retry_count: i32, now: DateTime<Utc>) -> RetryDecision {
        if error.classify() == FailureClass::Permanent || retry_count >= self.max_retries {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::Retry {
            retry_count: retry_count + 1,
            next_retry_at: next_retry_at(now, self.backoff_base, retry_count),
        }
    }
}
