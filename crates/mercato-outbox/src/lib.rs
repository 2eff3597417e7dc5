//! Mercato Outbox: reliable delivery of integration events.
//!
//! The [`poller::OutboxPoller`] drains the outbox table, fans each row out to
//! the handlers registered for its event type, and records per-handler
//! progress. Retryable failures back off exponentially; permanent failures
//! and exhausted retries are dead-lettered. A row is deleted once every
//! handler is terminal.

pub mod ack;
pub mod config;
pub mod pg_outbox_store;
pub mod poller;
pub mod registry;
pub mod retry;
