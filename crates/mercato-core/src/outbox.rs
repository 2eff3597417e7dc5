//! Transactional outbox records and the store abstraction used by the poller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Lifecycle of an outbox row or of one handler's processing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for dispatch.
    Pending,
    /// Claimed by a poller; handler running.
    Processing,
    /// Durably handled.
    Completed,
    /// Last attempt failed; waiting for `next_retry_at`.
    Failed,
}

impl DeliveryStatus {
    /// Column value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a column value.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for unknown values.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::Infrastructure(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// An integration event to insert into the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxMessage {
    /// Aggregate that produced the event.
    pub aggregate_id: Uuid,
    /// Event type used for handler routing.
    pub event_type: String,
    /// Event payload handed to handlers.
    pub payload: serde_json::Value,
    /// Unique per originating domain event.
    pub idempotency_key: String,
    /// When the originating event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Monotonically increasing row id.
    pub id: i64,
    /// Aggregate that produced the event.
    pub aggregate_id: Uuid,
    /// Event type used for handler routing.
    pub event_type: String,
    /// Event payload handed to handlers.
    pub payload: serde_json::Value,
    /// Row status.
    pub status: DeliveryStatus,
    /// Highest retry count among its handlers.
    pub retry_count: i32,
    /// Last dispatch attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time a waiting handler becomes due.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Unique per originating domain event.
    pub idempotency_key: String,
    /// When the originating event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// Delivery state of one (outbox row, handler) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRecord {
    /// Row id.
    pub id: i64,
    /// Parent outbox row.
    pub outbox_id: i64,
    /// Handler identity.
    pub handler_id: String,
    /// Hash of payload and handler identity.
    pub idempotency_key: String,
    /// Handler status.
    pub status: DeliveryStatus,
    /// Failed attempts so far.
    pub retry_count: i32,
    /// Last dispatch attempt; doubles as the claim token.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When a failed record becomes due again.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the handler completed.
    pub processed_at: Option<DateTime<Utc>>,
}

/// Terminal record of a handler that will not be retried automatically.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    /// Outbox row the failure belongs to.
    pub outbox_id: i64,
    /// Handler that failed.
    pub handler_id: String,
    /// Event type of the outbox row.
    pub event_type: String,
    /// Event payload.
    pub payload: serde_json::Value,
    /// Last handler error.
    pub error_message: String,
    /// Retry count at the time of dead-lettering.
    pub final_retry_count: i32,
    /// When the record was written.
    pub failed_at: DateTime<Utc>,
    /// When the originating event occurred.
    pub original_occurred_at: DateTime<Utc>,
}

/// A buffered write produced by the poller.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboxWrite {
    /// Create the processing record if absent, otherwise mark it `processing`.
    Claim {
        /// Parent outbox row.
        outbox_id: i64,
        /// Handler identity.
        handler_id: String,
        /// Processing record key.
        idempotency_key: String,
        /// Claim timestamp, stored as `last_attempt_at`.
        attempted_at: DateTime<Utc>,
    },
    /// The handler succeeded.
    Completed {
        /// Parent outbox row.
        outbox_id: i64,
        /// Processing record key.
        idempotency_key: String,
        /// Completion timestamp.
        processed_at: DateTime<Utc>,
    },
    /// The handler failed and will be retried.
    Retry {
        /// Parent outbox row.
        outbox_id: i64,
        /// Processing record key.
        idempotency_key: String,
        /// The incremented retry count.
        retry_count: i32,
        /// When the next attempt is due.
        next_retry_at: DateTime<Utc>,
        /// When the failed attempt ran.
        attempted_at: DateTime<Utc>,
    },
    /// The handler was dead-lettered; its processing record is removed.
    Failed {
        /// Parent outbox row.
        outbox_id: i64,
        /// Processing record key.
        idempotency_key: String,
    },
    /// The row has no registered handlers.
    MarkCompleted {
        /// Outbox row.
        outbox_id: i64,
    },
}

impl OutboxWrite {
    /// The outbox row this write touches.
    #[must_use]
    pub fn outbox_id(&self) -> i64 {
        match self {
            Self::Claim { outbox_id, .. }
            | Self::Completed { outbox_id, .. }
            | Self::Retry { outbox_id, .. }
            | Self::Failed { outbox_id, .. }
            | Self::MarkCompleted { outbox_id } => *outbox_id,
        }
    }
}

/// One handler that must be terminal before its outbox row is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedHandler {
    /// Handler identity.
    pub handler_id: String,
    /// Processing record key of this handler for the row's payload.
    pub idempotency_key: String,
}

/// Deletes `outbox_id` once every expected handler has a `completed`
/// processing record or a dead-letter row for this outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionCheck {
    /// Outbox row.
    pub outbox_id: i64,
    /// Handlers registered for the row's event type.
    pub handlers: Vec<ExpectedHandler>,
}

/// Durable storage behind the outbox poller.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Fetches up to `limit` undelivered rows, oldest first, skipping rows
    /// whose earliest retry is after `now`.
    async fn fetch_pending(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, DomainError>;

    /// Looks up a processing record by idempotency key.
    async fn find_processing(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ProcessingRecord>, DomainError>;

    /// Writes a dead-letter row in its own transaction.
    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), DomainError>;

    /// Whether `handler_id` already has a dead letter for the outbox row.
    async fn is_dead_lettered(&self, outbox_id: i64, handler_id: &str)
    -> Result<bool, DomainError>;

    /// Applies `writes` in order, then evaluates `checks`, all in one
    /// transaction. Returns the ids of deleted outbox rows.
    async fn apply(
        &self,
        writes: &[OutboxWrite],
        checks: &[CompletionCheck],
    ) -> Result<Vec<i64>, DomainError>;

    /// Lists dead-letter rows, newest first.
    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterRecord>, DomainError>;
}
