//! Mercato Catalog: products and collections.
//!
//! An example bounded context on top of the write core: every command loads
//! its aggregate from the snapshot, checks the caller's expected version, and
//! writes the new event, the new snapshot and one outbox row through a single
//! unit of work.

pub mod application;
pub mod domain;
