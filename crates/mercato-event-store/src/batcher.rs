//! Group commit for write batches.
//!
//! A single background task owns the only path that runs multi-statement
//! transactions. Units of work submit sealed batches over a bounded channel
//! and wait on a oneshot for the outcome. The task collects batches into a
//! cohort and flushes the cohort as one physical transaction when either the
//! number of pending entries reaches `batch_size_threshold` or
//! `flush_interval` has elapsed since the oldest unflushed batch arrived.
//!
//! A failed commit rejects every batch of the cohort. Nothing is retried
//! here; callers resubmit the whole logical operation.

use std::sync::Arc;
use std::time::Duration;

use mercato_core::error::DomainError;
use mercato_core::repository::{BatchExecutor, PendingWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

/// Default time a batch may wait for companions before being flushed.
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10;

/// Default number of pending entries that forces a flush.
const DEFAULT_BATCH_SIZE_THRESHOLD: usize = 500;

/// Default number of submitted batches the queue holds before back-pressure.
const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;

/// Configuration for the batcher.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Maximum time the oldest unflushed batch waits.
    pub flush_interval: Duration,
    /// Pending entry count that triggers an immediate flush.
    pub batch_size_threshold: usize,
    /// Capacity of the submission queue.
    pub max_queue_depth: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            batch_size_threshold: DEFAULT_BATCH_SIZE_THRESHOLD,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

struct Submission {
    entries: Vec<PendingWrite>,
    settle: oneshot::Sender<Result<(), DomainError>>,
}

enum BatcherMessage {
    Submit(Submission),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle for submitting batches.
#[derive(Debug, Clone)]
pub struct BatcherHandle {
    tx: mpsc::Sender<BatcherMessage>,
}

impl BatcherHandle {
    /// Submits a sealed batch and waits until it is committed or rejected.
    ///
    /// Empty batches settle immediately.
    ///
    /// # Errors
    ///
    /// Returns the batch's rejection (`PhysicalCommitFailure`,
    /// `ConcurrencyConflict`, ...) or `Infrastructure` if the batcher is gone.
    pub async fn submit(&self, entries: Vec<PendingWrite>) -> Result<(), DomainError> {
        if entries.is_empty() {
            return Ok(());
        }
        let (settle, settled) = oneshot::channel();

        self.tx
            .send(BatcherMessage::Submit(Submission { entries, settle }))
            .await
            .map_err(|_| DomainError::Infrastructure("batcher has shut down".to_owned()))?;

        settled.await.map_err(|_| {
            DomainError::Infrastructure("batcher dropped the batch settlement".to_owned())
        })?
    }
}

/// The running batcher task.
#[derive(Debug)]
pub struct Batcher {
    handle: BatcherHandle,
    task: JoinHandle<()>,
}

impl Batcher {
    /// Spawns the batcher loop on the current tokio runtime.
    #[must_use]
    pub fn spawn(executor: Arc<dyn BatchExecutor>, config: BatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.max_queue_depth.max(1));
        tracing::info!(
            flush_interval_ms = u64::try_from(config.flush_interval.as_millis()).unwrap_or(u64::MAX),
            batch_size_threshold = config.batch_size_threshold,
            max_queue_depth = config.max_queue_depth,
            "starting write batcher"
        );
        let task = tokio::spawn(run_batcher(executor, rx, config));
        Self {
            handle: BatcherHandle { tx },
            task,
        }
    }

    /// Returns a handle for submitting batches.
    #[must_use]
    pub fn handle(&self) -> BatcherHandle {
        self.handle.clone()
    }

    /// Stops accepting batches, flushes everything already queued, and waits
    /// for the loop to exit.
    pub async fn shutdown(self) {
        let (done, finished) = oneshot::channel();
        if self.handle.tx.send(BatcherMessage::Shutdown(done)).await.is_ok() {
            let _ = finished.await;
        }
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "write batcher task failed");
        }
        tracing::info!("write batcher stopped");
    }
}

/// Batches collected since the last flush.
struct Cohort {
    submissions: Vec<Submission>,
    entries: usize,
    oldest: Option<Instant>,
}

impl Cohort {
    fn new() -> Self {
        Self {
            submissions: Vec::new(),
            entries: 0,
            oldest: None,
        }
    }

    fn push(&mut self, submission: Submission) {
        if self.submissions.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.entries += submission.entries.len();
        self.submissions.push(submission);
    }

    fn take(&mut self) -> Vec<Submission> {
        self.entries = 0;
        self.oldest = None;
        std::mem::take(&mut self.submissions)
    }
}

async fn run_batcher(
    executor: Arc<dyn BatchExecutor>,
    mut rx: mpsc::Receiver<BatcherMessage>,
    config: BatcherConfig,
) {
    let mut cohort = Cohort::new();

    loop {
        let message = match cohort.oldest {
            None => rx.recv().await,
            Some(oldest) => {
                let remaining = config.flush_interval.saturating_sub(oldest.elapsed());
                if let Ok(message) = timeout(remaining, rx.recv()).await {
                    message
                } else {
                    flush(executor.as_ref(), cohort.take()).await;
                    continue;
                }
            }
        };

        match message {
            Some(BatcherMessage::Submit(submission)) => {
                cohort.push(submission);
                if cohort.entries >= config.batch_size_threshold {
                    flush(executor.as_ref(), cohort.take()).await;
                }
            }
            Some(BatcherMessage::Shutdown(done)) => {
                rx.close();
                while let Ok(message) = rx.try_recv() {
                    if let BatcherMessage::Submit(submission) = message {
                        cohort.push(submission);
                    }
                }
                flush(executor.as_ref(), cohort.take()).await;
                let _ = done.send(());
                break;
            }
            None => {
                flush(executor.as_ref(), cohort.take()).await;
                break;
            }
        }
    }
}

/// Runs one cohort as a single physical transaction and settles every batch.
async fn flush(executor: &dyn BatchExecutor, submissions: Vec<Submission>) {
    if submissions.is_empty() {
        return;
    }
    let batches: Vec<Vec<PendingWrite>> = submissions
        .iter()
        .map(|submission| submission.entries.clone())
        .collect();
    let entries: usize = batches.iter().map(Vec::len).sum();

    match executor.execute(&batches).await {
        Ok(results) => {
            let mut results = results.into_iter();
            let mut rejected = 0usize;
            for submission in submissions {
                let result = results.next().unwrap_or_else(|| {
                    Err(DomainError::Infrastructure(
                        "batch executor returned fewer results than batches".to_owned(),
                    ))
                });
                if let Err(e) = &result {
                    rejected += 1;
                    tracing::warn!(error = %e, "write batch rejected");
                }
                let _ = submission.settle.send(result);
            }
            tracing::debug!(
                batches = batches.len(),
                entries,
                rejected,
                "flushed write cohort"
            );
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                batches = batches.len(),
                entries,
                "write cohort commit failed; rejecting every batch"
            );
            for submission in submissions {
                let _ = submission.settle.send(Err(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use mercato_core::snapshot::SnapshotRecord;
    use uuid::Uuid;

    /// Records every cohort and answers with a configurable outcome.
    #[derive(Default)]
    struct RecordingExecutor {
        cohorts: Mutex<Vec<Vec<Vec<PendingWrite>>>>,
        fail_commit: bool,
        reject_batch: Option<usize>,
    }

    impl RecordingExecutor {
        fn cohorts(&self) -> Vec<Vec<Vec<PendingWrite>>> {
            self.cohorts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchExecutor for RecordingExecutor {
        async fn execute(
            &self,
            cohort: &[Vec<PendingWrite>],
        ) -> Result<Vec<Result<(), DomainError>>, DomainError> {
            self.cohorts.lock().unwrap().push(cohort.to_vec());
            if self.fail_commit {
                return Err(DomainError::PhysicalCommitFailure("disk full".into()));
            }
            Ok((0..cohort.len())
                .map(|index| {
                    if self.reject_batch == Some(index) {
                        Err(DomainError::ConcurrencyConflict {
                            aggregate_id: Uuid::nil(),
                            expected: 0,
                            actual: 1,
                        })
                    } else {
                        Ok(())
                    }
                })
                .collect())
        }
    }

    fn write(version: i64) -> PendingWrite {
        PendingWrite::SaveSnapshot(SnapshotRecord {
            aggregate_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            version,
            payload: serde_json::json!({"at": Utc::now().to_rfc3339()}),
        })
    }

    fn config(flush_interval_ms: u64, threshold: usize) -> BatcherConfig {
        BatcherConfig {
            flush_interval: Duration::from_millis(flush_interval_ms),
            batch_size_threshold: threshold,
            max_queue_depth: 64,
        }
    }

    #[tokio::test]
    async fn test_concurrent_batches_share_one_flush() {
        // Arrange
        let executor = Arc::new(RecordingExecutor::default());
        let batcher = Batcher::spawn(executor.clone(), config(50, 1000));
        let handle = batcher.handle();

        // Act
        let mut tasks = Vec::new();
        for i in 0..5 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.submit(vec![write(i)]).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        batcher.shutdown().await;

        // Assert
        let cohorts = executor.cohorts();
        let batches: usize = cohorts.iter().map(Vec::len).sum();
        assert_eq!(batches, 5);
        assert!(cohorts.len() <= 2, "expected at most 2 flushes, got {}", cohorts.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes_before_interval() {
        let executor = Arc::new(RecordingExecutor::default());
        let batcher = Batcher::spawn(executor.clone(), config(60_000, 2));
        let handle = batcher.handle();

        handle.submit(vec![write(0), write(1)]).await.unwrap();

        assert_eq!(executor.cohorts().len(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_cohort() {
        let executor = Arc::new(RecordingExecutor::default());
        let batcher = Batcher::spawn(executor.clone(), config(20, 1000));
        let handle = batcher.handle();
        let started = Instant::now();

        handle.submit(vec![write(0)]).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(executor.cohorts().len(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_commit_failure_rejects_whole_cohort() {
        // Arrange
        let executor = Arc::new(RecordingExecutor {
            fail_commit: true,
            ..RecordingExecutor::default()
        });
        let batcher = Batcher::spawn(executor.clone(), config(30, 1000));
        let handle = batcher.handle();

        // Act
        let a = tokio::spawn({
            let handle = handle.clone();
            async move { handle.submit(vec![write(0)]).await }
        });
        let b = tokio::spawn({
            let handle = handle.clone();
            async move { handle.submit(vec![write(1)]).await }
        });

        // Assert
        assert!(matches!(
            a.await.unwrap(),
            Err(DomainError::PhysicalCommitFailure(_))
        ));
        assert!(matches!(
            b.await.unwrap(),
            Err(DomainError::PhysicalCommitFailure(_))
        ));
        batcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_batch_does_not_fail_its_companions() {
        let executor = Arc::new(RecordingExecutor {
            reject_batch: Some(0),
            ..RecordingExecutor::default()
        });
        let batcher = Batcher::spawn(executor.clone(), config(1000, 2));
        let handle = batcher.handle();

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.submit(vec![write(0)]).await }
        });
        tokio::task::yield_now().await;
        let second = handle.submit(vec![write(1)]).await;

        assert!(matches!(
            first.await.unwrap(),
            Err(DomainError::ConcurrencyConflict { .. })
        ));
        assert!(second.is_ok());
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_batch_settles_without_flush() {
        let executor = Arc::new(RecordingExecutor::default());
        let batcher = Batcher::spawn(executor.clone(), config(10, 10));

        batcher.handle().submit(Vec::new()).await.unwrap();

        batcher.shutdown().await;
        assert!(executor.cohorts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_queued_batches() {
        // Arrange
        let executor = Arc::new(RecordingExecutor::default());
        let batcher = Batcher::spawn(executor.clone(), config(60_000, 1000));
        let handle = batcher.handle();
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.submit(vec![write(0)]).await }
        });
        tokio::task::yield_now().await;

        // Act
        batcher.shutdown().await;

        // Assert
        pending.await.unwrap().unwrap();
        assert_eq!(executor.cohorts().len(), 1);
        assert!(matches!(
            handle.submit(vec![write(1)]).await,
            Err(DomainError::Infrastructure(_))
        ));
    }
}
