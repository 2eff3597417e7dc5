//! In-memory store implementing every persistence seam of the write core.
//!
//! Each batch of a cohort runs against a copy of the state that is only kept
//! if every write of the batch succeeds, mirroring one `SAVEPOINT` per batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mercato_core::error::DomainError;
use mercato_core::outbox::{
    CompletionCheck, DeadLetterRecord, DeliveryStatus, NewOutboxMessage, OutboxRecord, OutboxStore,
    OutboxWrite, ProcessingRecord,
};
use mercato_core::repository::{BatchExecutor, PendingWrite, StoreReader, StoredEvent};
use mercato_core::snapshot::SnapshotRecord;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Tables {
    events: BTreeMap<(Uuid, i64), StoredEvent>,
    snapshots: HashMap<Uuid, SnapshotRecord>,
    outbox: BTreeMap<i64, OutboxRecord>,
    next_outbox_id: i64,
    processing: HashMap<String, ProcessingRecord>,
    next_processing_id: i64,
    dead_letters: Vec<DeadLetterRecord>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_commit: bool,
    fail_next_apply: bool,
    fail_next_fetch: bool,
}

/// A store that keeps every table in memory.
///
/// Implements [`StoreReader`], [`BatchExecutor`] and [`OutboxStore`], with
/// switches to fail the next physical commit, outbox flush or outbox fetch.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    commits: Mutex<usize>,
    applies: Mutex<usize>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `BatchExecutor::execute` fail at commit.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_next_commit(&self) {
        self.faults.lock().unwrap().fail_next_commit = true;
    }

    /// Makes the next `OutboxStore::apply` fail without writing anything.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_next_apply(&self) {
        self.faults.lock().unwrap().fail_next_apply = true;
    }

    /// Makes the next `OutboxStore::fetch_pending` fail.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_next_fetch(&self) {
        self.faults.lock().unwrap().fail_next_fetch = true;
    }

    /// Number of physical commits performed by the batch executor.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn commit_count(&self) -> usize {
        *self.commits.lock().unwrap()
    }

    /// Number of successful outbox flushes.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn apply_count(&self) -> usize {
        *self.applies.lock().unwrap()
    }

    /// Events of one aggregate in version order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn events(&self, aggregate_id: Uuid) -> Vec<StoredEvent> {
        self.tables
            .lock()
            .unwrap()
            .events
            .range((aggregate_id, i64::MIN)..=(aggregate_id, i64::MAX))
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Current snapshot of one aggregate.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn snapshot(&self, aggregate_id: Uuid) -> Option<SnapshotRecord> {
        self.tables
            .lock()
            .unwrap()
            .snapshots
            .get(&aggregate_id)
            .cloned()
    }

    /// All outbox rows in id order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn outbox_rows(&self) -> Vec<OutboxRecord> {
        self.tables.lock().unwrap().outbox.values().cloned().collect()
    }

    /// All processing records, ordered by id.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn processing_rows(&self) -> Vec<ProcessingRecord> {
        let mut rows: Vec<ProcessingRecord> = self
            .tables
            .lock()
            .unwrap()
            .processing
            .values()
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    /// All dead-letter rows in insertion order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn dead_letter_rows(&self) -> Vec<DeadLetterRecord> {
        self.tables.lock().unwrap().dead_letters.clone()
    }

    /// Inserts a pending outbox row directly and returns its id.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed_outbox(&self, message: NewOutboxMessage) -> i64 {
        let mut tables = self.tables.lock().unwrap();
        insert_outbox(&mut tables, message).unwrap()
    }

    /// Appends events directly to the event log, bypassing any batch.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed_events(&self, events: &[StoredEvent]) {
        let mut tables = self.tables.lock().unwrap();
        for event in events {
            tables
                .events
                .insert((event.aggregate_id, event.version), event.clone());
        }
    }
}

fn take_fault(flag: &mut bool) -> bool {
    std::mem::replace(flag, false)
}

fn insert_outbox(tables: &mut Tables, message: NewOutboxMessage) -> Result<i64, DomainError> {
    if tables
        .outbox
        .values()
        .any(|row| row.idempotency_key == message.idempotency_key)
    {
        return Err(DomainError::Infrastructure(format!(
            "enqueue_outbox failed: duplicate idempotency key {}",
            message.idempotency_key
        )));
    }
    tables.next_outbox_id += 1;
    let id = tables.next_outbox_id;
    tables.outbox.insert(
        id,
        OutboxRecord {
            id,
            aggregate_id: message.aggregate_id,
            event_type: message.event_type,
            payload: message.payload,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            idempotency_key: message.idempotency_key,
            occurred_at: message.occurred_at,
        },
    );
    Ok(id)
}

fn execute_write(tables: &mut Tables, write: &PendingWrite) -> Result<(), DomainError> {
    match write {
        PendingWrite::AppendEvent(event) => {
            let key = (event.aggregate_id, event.version);
            if tables.events.contains_key(&key) {
                return Err(DomainError::ConcurrencyConflict {
                    aggregate_id: event.aggregate_id,
                    expected: event.version - 1,
                    actual: event.version,
                });
            }
            tables.events.insert(key, event.clone());
        }
        PendingWrite::SaveSnapshot(snapshot) => {
            if let Some(existing) = tables.snapshots.get(&snapshot.aggregate_id) {
                if existing.version >= snapshot.version {
                    return Err(DomainError::ConcurrencyConflict {
                        aggregate_id: snapshot.aggregate_id,
                        expected: snapshot.version - 1,
                        actual: existing.version,
                    });
                }
            }
            tables
                .snapshots
                .insert(snapshot.aggregate_id, snapshot.clone());
        }
        PendingWrite::EnqueueOutbox(message) => {
            insert_outbox(tables, message.clone())?;
        }
    }
    Ok(())
}

fn apply_outbox_write(tables: &mut Tables, write: &OutboxWrite) {
    match write {
        OutboxWrite::Claim {
            outbox_id,
            handler_id,
            idempotency_key,
            attempted_at,
        } => {
            if !tables.outbox.contains_key(outbox_id)
                || has_dead_letter(tables, *outbox_id, handler_id)
            {
                return;
            }
            if let Some(record) = tables.processing.get_mut(idempotency_key) {
                if record.status != DeliveryStatus::Completed {
                    record.status = DeliveryStatus::Processing;
                    record.last_attempt_at = Some(*attempted_at);
                }
            } else {
                tables.next_processing_id += 1;
                let id = tables.next_processing_id;
                tables.processing.insert(
                    idempotency_key.clone(),
                    ProcessingRecord {
                        id,
                        outbox_id: *outbox_id,
                        handler_id: handler_id.clone(),
                        idempotency_key: idempotency_key.clone(),
                        status: DeliveryStatus::Processing,
                        retry_count: 0,
                        last_attempt_at: Some(*attempted_at),
                        next_retry_at: None,
                        processed_at: None,
                    },
                );
            }
            if let Some(row) = tables.outbox.get_mut(outbox_id) {
                row.status = DeliveryStatus::Processing;
                row.last_attempt_at = Some(*attempted_at);
            }
        }
        OutboxWrite::Completed {
            idempotency_key,
            processed_at,
            ..
        } => {
            if let Some(record) = tables.processing.get_mut(idempotency_key) {
                record.status = DeliveryStatus::Completed;
                record.processed_at = Some(*processed_at);
                record.next_retry_at = None;
            }
        }
        OutboxWrite::Retry {
            outbox_id,
            idempotency_key,
            retry_count,
            next_retry_at,
            attempted_at,
        } => {
            if let Some(record) = tables.processing.get_mut(idempotency_key) {
                record.status = DeliveryStatus::Failed;
                record.retry_count = *retry_count;
                record.next_retry_at = Some(*next_retry_at);
                record.last_attempt_at = Some(*attempted_at);
            }
            if let Some(row) = tables.outbox.get_mut(outbox_id) {
                row.status = DeliveryStatus::Failed;
                row.retry_count = row.retry_count.max(*retry_count);
                row.next_retry_at = Some(earliest(row.next_retry_at, *next_retry_at));
                row.last_attempt_at = Some(*attempted_at);
            }
        }
        OutboxWrite::Failed {
            idempotency_key, ..
        } => {
            tables.processing.remove(idempotency_key);
        }
        OutboxWrite::MarkCompleted { outbox_id } => {
            if let Some(row) = tables.outbox.get_mut(outbox_id) {
                row.status = DeliveryStatus::Completed;
            }
        }
    }
}

fn earliest(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> DateTime<Utc> {
    current.map_or(candidate, |current| current.min(candidate))
}

fn has_dead_letter(tables: &Tables, outbox_id: i64, handler_id: &str) -> bool {
    tables
        .dead_letters
        .iter()
        .any(|dead| dead.outbox_id == outbox_id && dead.handler_id == handler_id)
}

fn is_settled(tables: &Tables, check: &CompletionCheck) -> bool {
    check.handlers.iter().all(|handler| {
        let completed = tables
            .processing
            .get(&handler.idempotency_key)
            .is_some_and(|record| record.status == DeliveryStatus::Completed);
        completed || has_dead_letter(tables, check.outbox_id, &handler.handler_id)
    })
}

#[async_trait]
impl StoreReader for InMemoryStore {
    async fn load_events(&self, aggregate_id: Uuid) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(self.events(aggregate_id))
    }

    async fn get_snapshot(&self, aggregate_id: Uuid) -> Result<Option<SnapshotRecord>, DomainError> {
        Ok(self.snapshot(aggregate_id))
    }
}

#[async_trait]
impl BatchExecutor for InMemoryStore {
    async fn execute(
        &self,
        cohort: &[Vec<PendingWrite>],
    ) -> Result<Vec<Result<(), DomainError>>, DomainError> {
        if take_fault(&mut self.faults.lock().unwrap().fail_next_commit) {
            return Err(DomainError::PhysicalCommitFailure(
                "injected commit failure".into(),
            ));
        }

        let mut tables = self.tables.lock().unwrap();
        let mut results = Vec::with_capacity(cohort.len());
        for batch in cohort {
            let mut savepoint = tables.clone();
            let outcome = batch
                .iter()
                .try_for_each(|write| execute_write(&mut savepoint, write));
            if outcome.is_ok() {
                *tables = savepoint;
            }
            results.push(outcome);
        }
        *self.commits.lock().unwrap() += 1;
        Ok(results)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_pending(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, DomainError> {
        if take_fault(&mut self.faults.lock().unwrap().fail_next_fetch) {
            return Err(DomainError::Infrastructure("injected fetch failure".into()));
        }
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .tables
            .lock()
            .unwrap()
            .outbox
            .values()
            .filter(|row| row.status != DeliveryStatus::Completed)
            .filter(|row| row.next_retry_at.is_none_or(|due| due <= now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_processing(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ProcessingRecord>, DomainError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .processing
            .get(idempotency_key)
            .cloned())
    }

    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), DomainError> {
        self.tables
            .lock()
            .unwrap()
            .dead_letters
            .push(record.clone());
        Ok(())
    }

    async fn is_dead_lettered(
        &self,
        outbox_id: i64,
        handler_id: &str,
    ) -> Result<bool, DomainError> {
        Ok(has_dead_letter(&self.tables.lock().unwrap(), outbox_id, handler_id))
    }

    async fn apply(
        &self,
        writes: &[OutboxWrite],
        checks: &[CompletionCheck],
    ) -> Result<Vec<i64>, DomainError> {
        if take_fault(&mut self.faults.lock().unwrap().fail_next_apply) {
            return Err(DomainError::PhysicalCommitFailure(
                "injected outbox flush failure".into(),
            ));
        }

        let mut tables = self.tables.lock().unwrap();
        for write in writes {
            apply_outbox_write(&mut tables, write);
        }

        // Settle every check before deleting, so rows sharing a payload see
        // the processing records of each other.
        let deleted: Vec<i64> = checks
            .iter()
            .filter(|check| tables.outbox.contains_key(&check.outbox_id))
            .filter(|check| is_settled(&tables, check))
            .map(|check| check.outbox_id)
            .collect();
        for outbox_id in &deleted {
            tables.outbox.remove(outbox_id);
            tables
                .processing
                .retain(|_, record| record.outbox_id != *outbox_id);
        }
        *self.applies.lock().unwrap() += 1;
        Ok(deleted)
    }

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterRecord>, DomainError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .tables
            .lock()
            .unwrap()
            .dead_letters
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
