//! Batching implementation of `UnitOfWork`.

use std::future::Future;
use std::sync::Arc;

use mercato_core::error::DomainError;
use mercato_core::repository::{Repositories, StoreReader, UnitOfWork};

use crate::batch::WriteBatch;
use crate::batcher::BatcherHandle;

/// Unit of work that collects writes into a fresh [`WriteBatch`] and hands
/// it to the batcher once the caller's logic succeeds.
#[derive(Clone)]
pub struct BatchingUnitOfWork {
    reader: Arc<dyn StoreReader>,
    batcher: BatcherHandle,
}

impl BatchingUnitOfWork {
    /// Creates a unit of work reading through `reader` and committing through
    /// `batcher`.
    #[must_use]
    pub fn new(reader: Arc<dyn StoreReader>, batcher: BatcherHandle) -> Self {
        Self { reader, batcher }
    }
}

impl std::fmt::Debug for BatchingUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingUnitOfWork")
            .field("batcher", &self.batcher)
            .finish_non_exhaustive()
    }
}

impl UnitOfWork for BatchingUnitOfWork {
    fn with_transaction<T, F, Fut>(
        &self,
        work: F,
    ) -> impl Future<Output = Result<T, DomainError>> + Send
    where
        T: Send,
        F: FnOnce(Repositories) -> Fut + Send,
        Fut: Future<Output = Result<T, DomainError>> + Send,
    {
        async move {
            let batch = WriteBatch::new();
            let outcome = work(batch.repositories(Arc::clone(&self.reader))).await;
            let entries = batch.seal();

            match outcome {
                Ok(value) => {
                    let count = entries.len();
                    self.batcher.submit(entries).await?;
                    tracing::debug!(entries = count, "unit of work committed");
                    Ok(value)
                }
                Err(e) => {
                    tracing::debug!(
                        error = %e,
                        discarded = entries.len(),
                        "unit of work failed; batch discarded"
                    );
                    Err(e)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mercato_core::outbox::NewOutboxMessage;
    use mercato_core::snapshot::SnapshotRecord;
    use mercato_test_support::InMemoryStore;
    use uuid::Uuid;

    use crate::batcher::{Batcher, BatcherConfig};

    fn snapshot(aggregate_id: Uuid) -> SnapshotRecord {
        SnapshotRecord {
            aggregate_id,
            correlation_id: Uuid::new_v4(),
            version: 0,
            payload: serde_json::json!({"title": "Lamp"}),
        }
    }

    fn message(aggregate_id: Uuid) -> NewOutboxMessage {
        NewOutboxMessage {
            aggregate_id,
            event_type: "product.created".into(),
            payload: serde_json::json!({"title": "Lamp"}),
            idempotency_key: aggregate_id.to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_successful_work_is_visible_after_settlement() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let batcher = Batcher::spawn(store.clone(), BatcherConfig::default());
        let uow = BatchingUnitOfWork::new(store.clone(), batcher.handle());
        let aggregate_id = Uuid::new_v4();

        // Act
        let value = uow
            .with_transaction(|repos| async move {
                repos.snapshots.save_snapshot(snapshot(aggregate_id))?;
                repos.outbox.add_message(message(aggregate_id))?;
                Ok(42)
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(value, 42);
        assert!(store.snapshot(aggregate_id).is_some());
        assert_eq!(store.outbox_rows().len(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_work_writes_nothing() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let batcher = Batcher::spawn(store.clone(), BatcherConfig::default());
        let uow = BatchingUnitOfWork::new(store.clone(), batcher.handle());
        let aggregate_id = Uuid::new_v4();

        // Act
        let result: Result<(), DomainError> = uow
            .with_transaction(|repos| async move {
                repos.snapshots.save_snapshot(snapshot(aggregate_id))?;
                repos.outbox.add_message(message(aggregate_id))?;
                Err(DomainError::Validation("title must not be empty".into()))
            })
            .await;

        // Assert
        assert!(matches!(result, Err(DomainError::Validation(_))));
        batcher.shutdown().await;
        assert!(store.snapshot(aggregate_id).is_none());
        assert!(store.outbox_rows().is_empty());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_surfaces_to_caller() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_commit();
        let batcher = Batcher::spawn(store.clone(), BatcherConfig::default());
        let uow = BatchingUnitOfWork::new(store.clone(), batcher.handle());
        let aggregate_id = Uuid::new_v4();

        let result = uow
            .with_transaction(|repos| async move {
                repos.snapshots.save_snapshot(snapshot(aggregate_id))?;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(DomainError::PhysicalCommitFailure(_))));
        assert!(store.snapshot(aggregate_id).is_none());
        batcher.shutdown().await;
    }
}
