//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

/// Top-level domain error type.
#[derive(Debug, Clone, Error)]
pub enum DomainError {
    /// An aggregate (or its snapshot) was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// Optimistic concurrency conflict.
    #[error("concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: Uuid,
        /// The expected version.
        expected: i64,
        /// The actual version found.
        actual: i64,
    },

    /// A business precondition for a state transition was violated.
    #[error("invalid state transition on aggregate {aggregate_id}: cannot {operation} while {from}")]
    InvalidStateTransition {
        /// The aggregate that rejected the operation.
        aggregate_id: Uuid,
        /// The lifecycle state the aggregate was in.
        from: String,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// The store rejected a physical transaction (BEGIN/COMMIT level).
    #[error("physical commit failed: {0}")]
    PhysicalCommitFailure(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns `true` if resubmitting the same logical operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::PhysicalCommitFailure(_)
        )
    }
}

/// Failure reported by an integration event handler.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The handler declared the failure permanent; never retried.
    #[error("permanent handler failure: {0}")]
    Permanent(String),

    /// The handler declared the failure transient; retried with backoff.
    #[error("retryable handler failure: {0}")]
    Retryable(String),

    /// An unclassified failure; classified by its message.
    #[error("{0}")]
    Failed(String),
}

/// How the outbox treats a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Dead-letter immediately.
    Permanent,
    /// Schedule another attempt.
    Retryable,
}

/// Message fragments that mark an unclassified failure as permanent.
const PERMANENT_MARKERS: [&str; 5] = ["validation", "invalid", "not found", "unauthorized", "forbidden"];

impl HandlerError {
    /// Classifies the failure.
    ///
    /// Structured variants win; `Failed` messages are permanent when they
    /// mention any of the permanent markers (case-insensitive).
    #[must_use]
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Permanent(_) => FailureClass::Permanent,
            Self::Retryable(_) => FailureClass::Retryable,
            Self::Failed(message) => {
                let lowered = message.to_lowercase();
                if PERMANENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
                    FailureClass::Permanent
                } else {
                    FailureClass::Retryable
                }
            }
        }
    }

    /// Returns the underlying message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Permanent(message) | Self::Retryable(message) | Self::Failed(message) => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_is_permanent() {
        let err = HandlerError::Failed("customer Not Found upstream".into());

        assert_eq!(err.classify(), FailureClass::Permanent);
    }

    #[test]
    fn test_each_marker_is_permanent() {
        for marker in PERMANENT_MARKERS {
            let err = HandlerError::Failed(format!("request rejected: {marker}"));
            assert_eq!(err.classify(), FailureClass::Permanent, "marker {marker}");
        }
    }

    #[test]
    fn test_timeout_message_is_retryable() {
        let err = HandlerError::Failed("connection timed out".into());

        assert_eq!(err.classify(), FailureClass::Retryable);
    }

    #[test]
    fn test_structured_variants_override_message() {
        assert_eq!(
            HandlerError::Retryable("invalid gateway response".into()).classify(),
            FailureClass::Retryable
        );
        assert_eq!(
            HandlerError::Permanent("try later".into()).classify(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_commit_failures_are_transient() {
        assert!(DomainError::PhysicalCommitFailure("disk full".into()).is_transient());
        assert!(!DomainError::Validation("empty title".into()).is_transient());
    }
}
