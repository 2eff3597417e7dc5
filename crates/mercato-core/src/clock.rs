//! Clock abstraction for determinism.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};

/// Abstraction over system time for deterministic behavior.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time at the store's precision (microseconds).
    ///
    /// Timestamps that are written and later compared for equality must use
    /// this, or the round trip through `TIMESTAMPTZ` changes them.
    fn now_stored(&self) -> DateTime<Utc> {
        self.now().trunc_subsecs(6)
    }
}

/// Clock shared between the command path and background loops.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
