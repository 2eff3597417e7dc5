//! Shared test doubles for the Mercato write core.

mod clock;
mod store;

pub use clock::{FixedClock, ManualClock};
pub use store::InMemoryStore;
