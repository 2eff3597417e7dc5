//! The write batch shared by every repository of one unit of work.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use mercato_core::error::DomainError;
use mercato_core::outbox::NewOutboxMessage;
use mercato_core::repository::{
    EventRepository, OutboxRepository, PendingWrite, Repositories, SnapshotRepository,
    StoreReader, StoredEvent,
};
use mercato_core::snapshot::SnapshotRecord;
use uuid::Uuid;

#[derive(Debug, Default)]
struct BatchState {
    entries: Vec<PendingWrite>,
    sealed: bool,
}

/// Ordered list of pending writes collected during one unit of work.
///
/// Cloning shares the same list. Once sealed, further pushes fail.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    state: Arc<Mutex<BatchState>>,
}

impl WriteBatch {
    /// Creates an empty, open batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a write.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the batch was already sealed.
    pub fn push(&self, write: PendingWrite) -> Result<(), DomainError> {
        let mut state = self.lock();
        if state.sealed {
            return Err(DomainError::Infrastructure(format!(
                "write batch already sealed; rejected {} for {}",
                write.kind(),
                write.aggregate_id()
            )));
        }
        state.entries.push(write);
        Ok(())
    }

    /// Returns the most recent snapshot queued for `aggregate_id`, if any.
    #[must_use]
    pub fn pending_snapshot(&self, aggregate_id: Uuid) -> Option<SnapshotRecord> {
        self.lock().entries.iter().rev().find_map(|write| match write {
            PendingWrite::SaveSnapshot(snapshot) if snapshot.aggregate_id == aggregate_id => {
                Some(snapshot.clone())
            }
            _ => None,
        })
    }

    /// Number of queued writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if nothing was queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Closes the batch and takes its entries.
    #[must_use]
    pub fn seal(&self) -> Vec<PendingWrite> {
        let mut state = self.lock();
        state.sealed = true;
        std::mem::take(&mut state.entries)
    }

    /// Builds the repositories of one unit of work, all bound to this batch.
    #[must_use]
    pub fn repositories(&self, reader: Arc<dyn StoreReader>) -> Repositories {
        Repositories {
            events: Arc::new(BatchEventRepository {
                batch: self.clone(),
            }),
            snapshots: Arc::new(BatchSnapshotRepository {
                batch: self.clone(),
                reader,
            }),
            outbox: Arc::new(BatchOutboxRepository {
                batch: self.clone(),
            }),
        }
    }
}

/// Event log repository that enqueues onto a write batch.
#[derive(Debug)]
pub struct BatchEventRepository {
    batch: WriteBatch,
}

impl EventRepository for BatchEventRepository {
    fn add_event(&self, event: StoredEvent) -> Result<(), DomainError> {
        self.batch.push(PendingWrite::AppendEvent(event))
    }
}

/// Snapshot repository that reads through the store and enqueues upserts.
///
/// Reads see snapshots queued earlier in the same batch.
pub struct BatchSnapshotRepository {
    batch: WriteBatch,
    reader: Arc<dyn StoreReader>,
}

#[async_trait]
impl SnapshotRepository for BatchSnapshotRepository {
    async fn get_snapshot(&self, aggregate_id: Uuid) -> Result<Option<SnapshotRecord>, DomainError> {
        if let Some(snapshot) = self.batch.pending_snapshot(aggregate_id) {
            return Ok(Some(snapshot));
        }
        self.reader.get_snapshot(aggregate_id).await
    }

    fn save_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), DomainError> {
        self.batch.push(PendingWrite::SaveSnapshot(snapshot))
    }
}

/// Outbox repository that enqueues onto a write batch.
#[derive(Debug)]
pub struct BatchOutboxRepository {
    batch: WriteBatch,
}

impl OutboxRepository for BatchOutboxRepository {
    fn add_message(&self, message: NewOutboxMessage) -> Result<(), DomainError> {
        self.batch.push(PendingWrite::EnqueueOutbox(message))
    }
}
