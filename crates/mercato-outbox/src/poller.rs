//! The outbox poller.
//!
//! Two loops run while the poller is started. The poll loop fetches due
//! outbox rows and runs every registered handler of each row in sequence;
//! the flush loop periodically writes buffered acknowledgments.
//!
//! Before a handler runs, its processing record is claimed and the claim is
//! flushed, then re-read. The claim carries its timestamp, and the handler
//! only runs if the stored record still shows that timestamp. A record that
//! another dispatch claimed less than `handler_timeout` ago is left alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use mercato_core::clock::SharedClock;
use mercato_core::error::{DomainError, HandlerError};
use mercato_core::idempotency::idempotency_key;
use mercato_core::outbox::{
    CompletionCheck, DeadLetterRecord, DeliveryStatus, ExpectedHandler, OutboxRecord, OutboxStore,
    OutboxWrite, ProcessingRecord,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};

use crate::ack::AckBuffer;
use crate::config::PollerConfig;
use crate::registry::{HandlerRegistry, RegisteredHandler};
use crate::retry::{RetryDecision, RetryPolicy};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What happened to one handler of one outbox row during a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler ran and succeeded.
    Completed,
    /// The handler was not invoked (done, not due, or claimed elsewhere).
    Skipped,
    /// The handler failed and another attempt is scheduled.
    Retrying,
    /// The handler failed terminally and was dead-lettered.
    DeadLettered,
}

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Rows fetched.
    pub fetched: usize,
    /// Rows without any registered handler.
    pub unhandled: usize,
    /// Handlers that succeeded.
    pub completed: usize,
    /// Handlers not invoked.
    pub skipped: usize,
    /// Handlers scheduled for another attempt.
    pub retrying: usize,
    /// Handlers dead-lettered.
    pub dead_lettered: usize,
}

impl PollReport {
    fn record(&mut self, outcome: HandlerOutcome) {
        match outcome {
            HandlerOutcome::Completed => self.completed += 1,
            HandlerOutcome::Skipped => self.skipped += 1,
            HandlerOutcome::Retrying => self.retrying += 1,
            HandlerOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

struct PollerCore {
    store: Arc<dyn OutboxStore>,
    registry: Arc<HandlerRegistry>,
    clock: SharedClock,
    config: PollerConfig,
    policy: RetryPolicy,
    buffer: Mutex<AckBuffer>,
    flush_lock: tokio::sync::Mutex<()>,
    threshold_flush_scheduled: AtomicBool,
    flush_errors: mpsc::UnboundedSender<DomainError>,
}

struct RunningLoops {
    shutdown: watch::Sender<bool>,
    poll_loop: JoinHandle<()>,
    flush_loop: JoinHandle<mpsc::UnboundedReceiver<DomainError>>,
}

/// Drains the outbox and dispatches rows to their handlers.
///
/// Dropping a started poller ends both loops without a final flush; call
/// [`OutboxPoller::stop`] for a graceful shutdown.
pub struct OutboxPoller {
    core: Arc<PollerCore>,
    flush_errors: Mutex<Option<mpsc::UnboundedReceiver<DomainError>>>,
    running: Mutex<Option<RunningLoops>>,
}

impl std::fmt::Debug for OutboxPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxPoller")
            .field("config", &self.core.config)
            .field("handlers", &self.core.registry.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl OutboxPoller {
    /// Creates a stopped poller.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        registry: Arc<HandlerRegistry>,
        clock: SharedClock,
        config: PollerConfig,
    ) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let policy = config.retry_policy();
        Self {
            core: Arc::new(PollerCore {
                store,
                registry,
                clock,
                config,
                policy,
                buffer: Mutex::new(AckBuffer::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                threshold_flush_scheduled: AtomicBool::new(false),
                flush_errors: errors_tx,
            }),
            flush_errors: Mutex::new(Some(errors_rx)),
            running: Mutex::new(None),
        }
    }

    /// Starts the poll and flush loops on the current tokio runtime.
    ///
    /// Does nothing if the poller is already running.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            tracing::warn!("outbox poller already running");
            return;
        }
        let Some(errors) = lock(&self.flush_errors).take() else {
            tracing::error!("outbox flush error channel is gone; poller not started");
            return;
        };

        let (shutdown, _) = watch::channel(false);
        let poll_loop = tokio::spawn(run_poll_loop(
            Arc::clone(&self.core),
            shutdown.subscribe(),
        ));
        let flush_loop = tokio::spawn(run_flush_loop(
            Arc::clone(&self.core),
            errors,
            shutdown.subscribe(),
        ));
        *running = Some(RunningLoops {
            shutdown,
            poll_loop,
            flush_loop,
        });

        let config = &self.core.config;
        tracing::info!(
            poll_interval_ms = u64::try_from(config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            flush_interval_ms =
                u64::try_from(config.batch_flush_interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = config.batch_size,
            max_retries = config.max_retries,
            handlers = self.core.registry.len(),
            "outbox poller started"
        );
    }

    /// Stops both loops, waits for an in-flight poll cycle to finish, then
    /// flushes everything still buffered.
    ///
    /// Returns the number of writes the final flush applied.
    ///
    /// # Errors
    ///
    /// Returns the final flush's error; the writes stay buffered.
    pub async fn stop(&self) -> Result<usize, DomainError> {
        let running = lock(&self.running).take();
        if let Some(loops) = running {
            let _ = loops.shutdown.send(true);
            if let Err(e) = loops.poll_loop.await {
                tracing::error!(error = %e, "outbox poll loop failed");
            }
            match loops.flush_loop.await {
                Ok(errors) => *lock(&self.flush_errors) = Some(errors),
                Err(e) => tracing::error!(error = %e, "outbox flush loop failed"),
            }
        }

        let flushed = self.core.flush().await?;
        tracing::info!(flushed, "outbox poller stopped");
        Ok(flushed)
    }

    /// Returns `true` between [`start`](Self::start) and [`stop`](Self::stop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Runs one poll cycle.
    ///
    /// # Errors
    ///
    /// Returns a store error; the rest of the cycle is abandoned and the
    /// next cycle starts over.
    pub async fn poll_once(&self) -> Result<PollReport, DomainError> {
        self.core.poll_once().await
    }

    /// Writes every buffered acknowledgment in one transaction.
    ///
    /// Returns the number of writes applied.
    ///
    /// # Errors
    ///
    /// Returns the store error; the writes are requeued.
    pub async fn flush(&self) -> Result<usize, DomainError> {
        self.core.flush().await
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        lock(&self.core.buffer).len()
    }
}

async fn run_poll_loop(core: Arc<PollerCore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = core.poll_once().await {
                    tracing::error!(error = %e, "outbox poll cycle failed");
                }
            }
        }
    }
}

async fn run_flush_loop(
    core: Arc<PollerCore>,
    mut errors: mpsc::UnboundedReceiver<DomainError>,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::UnboundedReceiver<DomainError> {
    let period = core.config.batch_flush_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(e) = errors.recv() => {
                tracing::error!(error = %e, "background outbox flush failed");
            }
            _ = ticker.tick() => {
                if let Err(e) = core.flush().await {
                    tracing::error!(error = %e, "periodic outbox flush failed");
                }
            }
        }
    }
    errors
}

impl PollerCore {
    async fn poll_once(self: &Arc<Self>) -> Result<PollReport, DomainError> {
        let limit = i64::try_from(self.config.batch_size).unwrap_or(i64::MAX);
        let records = self.store.fetch_pending(limit, self.clock.now()).await?;
        let mut report = PollReport {
            fetched: records.len(),
            ..PollReport::default()
        };

        for record in &records {
            self.process_record(record, &mut report).await?;
        }

        if report.fetched > 0 {
            tracing::debug!(
                fetched = report.fetched,
                completed = report.completed,
                skipped = report.skipped,
                retrying = report.retrying,
                dead_lettered = report.dead_lettered,
                "outbox poll cycle finished"
            );
        }
        Ok(report)
    }

    async fn process_record(
        self: &Arc<Self>,
        record: &OutboxRecord,
        report: &mut PollReport,
    ) -> Result<(), DomainError> {
        let handlers = self.registry.handlers_for(&record.event_type);
        if handlers.is_empty() {
            tracing::debug!(
                outbox_id = record.id,
                event_type = %record.event_type,
                "no handlers registered; marking outbox row completed"
            );
            report.unhandled += 1;
            self.enqueue(OutboxWrite::MarkCompleted {
                outbox_id: record.id,
            });
            return Ok(());
        }

        let mut expected = Vec::with_capacity(handlers.len());
        for registered in handlers {
            let key = idempotency_key(&record.payload, &registered.handler_id);
            let outcome = self.process_handler(record, registered, &key).await?;
            report.record(outcome);
            expected.push(ExpectedHandler {
                handler_id: registered.handler_id.clone(),
                idempotency_key: key,
            });
        }

        lock(&self.buffer).track(CompletionCheck {
            outbox_id: record.id,
            handlers: expected,
        });
        Ok(())
    }

    async fn process_handler(
        self: &Arc<Self>,
        record: &OutboxRecord,
        registered: &RegisteredHandler,
        key: &str,
    ) -> Result<HandlerOutcome, DomainError> {
        let handler_id = registered.handler_id.as_str();
        // A failed ack deletes the processing record, so only the dead letter
        // remembers the handler while a sibling keeps the row alive.
        if self.store.is_dead_lettered(record.id, handler_id).await? {
            tracing::debug!(
                outbox_id = record.id,
                handler_id,
                reason = "dead-lettered",
                "handler skipped"
            );
            return Ok(HandlerOutcome::Skipped);
        }
        if let Some(existing) = self.store.find_processing(key).await? {
            if let Some(reason) = self.skip_reason(&existing, self.clock.now()) {
                tracing::debug!(outbox_id = record.id, handler_id, reason, "handler skipped");
                return Ok(HandlerOutcome::Skipped);
            }
        }

        let claimed_at = self.clock.now_stored();
        lock(&self.buffer).push(OutboxWrite::Claim {
            outbox_id: record.id,
            handler_id: handler_id.to_owned(),
            idempotency_key: key.to_owned(),
            attempted_at: claimed_at,
        });
        self.flush().await?;

        let Some(claimed) = self.store.find_processing(key).await? else {
            tracing::debug!(
                outbox_id = record.id,
                handler_id,
                "outbox row gone or handler dead-lettered before dispatch"
            );
            return Ok(HandlerOutcome::Skipped);
        };
        if claimed.status != DeliveryStatus::Processing || claimed.last_attempt_at != Some(claimed_at)
        {
            tracing::debug!(outbox_id = record.id, handler_id, "handler claimed by another dispatch");
            return Ok(HandlerOutcome::Skipped);
        }

        let result = match timeout(
            self.config.handler_timeout,
            registered.handler.handle(&record.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Retryable(format!(
                "handler timed out after {} ms",
                self.config.handler_timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                tracing::debug!(outbox_id = record.id, handler_id, "handler completed");
                self.enqueue(OutboxWrite::Completed {
                    outbox_id: record.id,
                    idempotency_key: key.to_owned(),
                    processed_at: self.clock.now_stored(),
                });
                Ok(HandlerOutcome::Completed)
            }
            Err(error) => {
                self.handle_failure(record, handler_id, key, claimed.retry_count, claimed_at, &error)
                    .await
            }
        }
    }

    fn skip_reason(&self, existing: &ProcessingRecord, now: DateTime<Utc>) -> Option<&'static str> {
        let in_flight_window =
            TimeDelta::from_std(self.config.handler_timeout).unwrap_or(TimeDelta::MAX);
        match existing.status {
            DeliveryStatus::Completed => Some("already completed"),
            DeliveryStatus::Failed if existing.next_retry_at.is_some_and(|due| due > now) => {
                Some("retry not yet due")
            }
            DeliveryStatus::Processing
                if existing
                    .last_attempt_at
                    .is_some_and(|at| now - at < in_flight_window) =>
            {
                Some("in flight")
            }
            _ => None,
        }
    }

    async fn handle_failure(
        self: &Arc<Self>,
        record: &OutboxRecord,
        handler_id: &str,
        key: &str,
        retry_count: i32,
        attempted_at: DateTime<Utc>,
        error: &HandlerError,
    ) -> Result<HandlerOutcome, DomainError> {
        match self.policy.decide(error, retry_count, self.clock.now()) {
            RetryDecision::DeadLetter => {
                let dead_letter = DeadLetterRecord {
                    outbox_id: record.id,
                    handler_id: handler_id.to_owned(),
                    event_type: record.event_type.clone(),
                    payload: record.payload.clone(),
                    error_message: error.message().to_owned(),
                    final_retry_count: retry_count,
                    failed_at: self.clock.now_stored(),
                    original_occurred_at: record.occurred_at,
                };
                self.store.insert_dead_letter(&dead_letter).await?;
                tracing::warn!(
                    outbox_id = record.id,
                    handler_id,
                    retry_count,
                    error = %error,
                    "handler dead-lettered"
                );
                self.enqueue(OutboxWrite::Failed {
                    outbox_id: record.id,
                    idempotency_key: key.to_owned(),
                });
                Ok(HandlerOutcome::DeadLettered)
            }
            RetryDecision::Retry {
                retry_count,
                next_retry_at,
            } => {
                tracing::info!(
                    outbox_id = record.id,
                    handler_id,
                    retry_count,
                    %next_retry_at,
                    error = %error,
                    "handler failed; retry scheduled"
                );
                self.enqueue(OutboxWrite::Retry {
                    outbox_id: record.id,
                    idempotency_key: key.to_owned(),
                    retry_count,
                    next_retry_at,
                    attempted_at,
                });
                Ok(HandlerOutcome::Retrying)
            }
        }
    }

    /// Buffers a write and schedules a background flush at the threshold.
    fn enqueue(self: &Arc<Self>, write: OutboxWrite) {
        let buffered = lock(&self.buffer).push(write);
        if buffered < self.config.batch_size_threshold
            || self.threshold_flush_scheduled.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.threshold_flush_scheduled.store(false, Ordering::Release);
            if let Err(e) = core.flush().await {
                let _ = core.flush_errors.send(e);
            }
        });
    }

    async fn flush(&self) -> Result<usize, DomainError> {
        let _flushing = self.flush_lock.lock().await;
        let batch = lock(&self.buffer).take();
        if batch.is_empty() {
            return Ok(0);
        }

        let writes = batch.writes.len();
        match self.store.apply(&batch.writes, &batch.checks).await {
            Ok(deleted) => {
                for outbox_id in &deleted {
                    tracing::debug!(outbox_id, "outbox row fully processed; deleted");
                }
                tracing::debug!(
                    writes,
                    checks = batch.checks.len(),
                    deleted = deleted.len(),
                    "flushed outbox acknowledgments"
                );
                Ok(writes)
            }
            Err(e) => {
                tracing::warn!(error = %e, writes, "outbox flush failed; writes requeued");
                lock(&self.buffer).requeue(batch);
                Err(e)
            }
        }
    }
}
