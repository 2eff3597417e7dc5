//! Repository, unit-of-work and store abstractions.
//!
//! Repositories never commit. Inside a unit of work they only enqueue
//! [`PendingWrite`]s onto the shared write batch; the batch is later executed
//! by a [`BatchExecutor`] as part of one physical transaction.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DomainError;
use crate::outbox::NewOutboxMessage;
use crate::snapshot::SnapshotRecord;

/// Stored representation of a domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Serialized event payload (prior and new state).
    pub payload: serde_json::Value,
    /// The aggregate version this event produced.
    pub version: i64,
    /// Correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor that issued the command.
    pub user_id: String,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

/// One entry of a write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// Insert into the append-only event log.
    AppendEvent(StoredEvent),
    /// Insert or replace the aggregate's snapshot.
    SaveSnapshot(SnapshotRecord),
    /// Insert a pending outbox row.
    EnqueueOutbox(NewOutboxMessage),
}

impl PendingWrite {
    /// Short name of the write kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AppendEvent(_) => "append_event",
            Self::SaveSnapshot(_) => "save_snapshot",
            Self::EnqueueOutbox(_) => "enqueue_outbox",
        }
    }

    /// The aggregate the write belongs to.
    #[must_use]
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            Self::AppendEvent(event) => event.aggregate_id,
            Self::SaveSnapshot(snapshot) => snapshot.aggregate_id,
            Self::EnqueueOutbox(message) => message.aggregate_id,
        }
    }
}

/// Event log repository bound to a write batch.
pub trait EventRepository: Send + Sync {
    /// Enqueues an event insert. Does not execute immediately.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the batch is no longer open.
    fn add_event(&self, event: StoredEvent) -> Result<(), DomainError>;
}

/// Snapshot repository bound to a write batch.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Reads the latest snapshot, or `None` if the aggregate has none.
    async fn get_snapshot(&self, aggregate_id: Uuid) -> Result<Option<SnapshotRecord>, DomainError>;

    /// Enqueues an upsert keyed by `aggregate_id`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the batch is no longer open.
    fn save_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), DomainError>;
}

/// Outbox repository bound to a write batch.
pub trait OutboxRepository: Send + Sync {
    /// Enqueues an outbox insert in the same transaction as the state change.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the batch is no longer open.
    fn add_message(&self, message: NewOutboxMessage) -> Result<(), DomainError>;
}

/// The repositories handed to one unit of work. All of them share one batch.
#[derive(Clone)]
pub struct Repositories {
    /// Event log.
    pub events: Arc<dyn EventRepository>,
    /// Snapshot store.
    pub snapshots: Arc<dyn SnapshotRepository>,
    /// Outbox.
    pub outbox: Arc<dyn OutboxRepository>,
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}

/// Runs one logical operation against a fresh write batch.
pub trait UnitOfWork: Send + Sync {
    /// Creates a fresh batch, hands `work` repositories bound to it, and
    /// waits until the batch is physically committed.
    ///
    /// If `work` fails, the batch is discarded and nothing is written.
    fn with_transaction<T, F, Fut>(
        &self,
        work: F,
    ) -> impl Future<Output = Result<T, DomainError>> + Send
    where
        T: Send,
        F: FnOnce(Repositories) -> Fut + Send,
        Fut: Future<Output = Result<T, DomainError>> + Send;
}

/// Read access to the event log and snapshot store.
#[async_trait]
pub trait StoreReader: Send + Sync {
    /// Load all events for an aggregate, ordered by version.
    async fn load_events(&self, aggregate_id: Uuid) -> Result<Vec<StoredEvent>, DomainError>;

    /// Load the latest snapshot for an aggregate.
    async fn get_snapshot(&self, aggregate_id: Uuid) -> Result<Option<SnapshotRecord>, DomainError>;
}

/// Executes a cohort of write batches as one physical transaction.
#[async_trait]
pub trait BatchExecutor: Send + Sync + 'static {
    /// Runs every batch of `cohort` inside one transaction.
    ///
    /// Returns one result per batch: a batch whose own statements fail is
    /// rolled back on its own and reported as `Err`, the rest still commit.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::PhysicalCommitFailure` if the transaction itself
    /// could not be opened or committed; no batch of the cohort is durable.
    async fn execute(
        &self,
        cohort: &[Vec<PendingWrite>],
    ) -> Result<Vec<Result<(), DomainError>>, DomainError>;
}
