//! Mercato write-core server library.
//!
//! Configuration, telemetry, integration handlers and the assembled
//! [`state::WriteCore`] used by the `mercato-server` binary.

pub mod config;
pub mod error;
pub mod handlers;
pub mod state;
pub mod telemetry;
