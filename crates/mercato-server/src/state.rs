//! The assembled write core: batcher, unit of work and outbox poller over
//! one connection pool.

use std::sync::Arc;

use mercato_core::clock::SharedClock;
use mercato_event_store::batcher::Batcher;
use mercato_event_store::pg_batch_executor::PgBatchExecutor;
use mercato_event_store::pg_store_reader::PgStoreReader;
use mercato_event_store::unit_of_work::BatchingUnitOfWork;
use mercato_outbox::pg_outbox_store::PgOutboxStore;
use mercato_outbox::poller::OutboxPoller;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::handlers;

/// Write-side state shared by everything that issues catalog commands.
pub struct WriteCore {
    /// Clock stamped into events and outbox bookkeeping.
    pub clock: SharedClock,
    /// Write path handed to command handlers.
    pub unit_of_work: BatchingUnitOfWork,
    /// Outbox dispatcher; stopped until [`OutboxPoller::start`].
    pub poller: OutboxPoller,
    batcher: Batcher,
}

impl std::fmt::Debug for WriteCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCore")
            .field("unit_of_work", &self.unit_of_work)
            .field("poller", &self.poller)
            .field("batcher", &self.batcher)
            .finish_non_exhaustive()
    }
}

impl WriteCore {
    /// Spawns the batcher and wires the unit of work and poller to `db_pool`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Domain` if the handler registry cannot be built.
    pub fn assemble(
        db_pool: &PgPool,
        clock: SharedClock,
        config: &AppConfig,
    ) -> Result<Self, AppError> {
        let batcher = Batcher::spawn(
            Arc::new(PgBatchExecutor::new(db_pool.clone())),
            config.batcher.clone(),
        );
        let unit_of_work = BatchingUnitOfWork::new(
            Arc::new(PgStoreReader::new(db_pool.clone())),
            batcher.handle(),
        );
        let poller = OutboxPoller::new(
            Arc::new(PgOutboxStore::new(db_pool.clone())),
            Arc::new(handlers::build_registry()?),
            Arc::clone(&clock),
            config.poller.clone(),
        );
        Ok(Self {
            clock,
            unit_of_work,
            poller,
            batcher,
        })
    }

    /// Stops the poller with a final flush, then drains the batcher.
    /// Returns the number of acknowledgments written by the final flush.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Domain` if the final outbox flush fails; the
    /// batcher is drained either way.
    pub async fn shutdown(self) -> Result<usize, AppError> {
        let stopped = self.poller.stop().await;
        self.batcher.shutdown().await;
        Ok(stopped?)
    }
}
