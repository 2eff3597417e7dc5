//! Mercato Event Store: write batching and PostgreSQL persistence.
//!
//! Command handlers run inside a [`unit_of_work::BatchingUnitOfWork`]; every
//! repository they touch enqueues onto one [`batch::WriteBatch`], which the
//! [`batcher::Batcher`] coalesces with concurrent batches into a single
//! physical transaction.

pub mod batch;
pub mod batcher;
pub mod pg_batch_executor;
pub mod pg_store_reader;
pub mod schema;
pub mod unit_of_work;
