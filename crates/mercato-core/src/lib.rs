//! Mercato Core: the event-sourced write kernel.
//!
//! This crate defines the aggregate kernel, the domain event envelope, the
//! error taxonomy and the seams (repositories, unit of work, batch executor,
//! outbox store) that infrastructure crates implement. It contains no
//! infrastructure code.

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod outbox;
pub mod repository;
pub mod snapshot;
