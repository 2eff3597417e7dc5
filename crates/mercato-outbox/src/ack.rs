//! Acknowledgment buffer.
//!
//! Processing-record writes and acknowledgments queue here in the order the
//! poller produced them, together with the completion checks of the outbox
//! rows they touch. A flush drains everything at once; a failed flush puts
//! it back in front of whatever arrived meanwhile.

use std::collections::{BTreeMap, VecDeque};

use mercato_core::outbox::{CompletionCheck, OutboxWrite};

/// Everything drained by one flush.
#[derive(Debug, Default, PartialEq)]
pub struct AckBatch {
    /// Writes, oldest first.
    pub writes: Vec<OutboxWrite>,
    /// Rows to delete once their handlers are all terminal.
    pub checks: Vec<CompletionCheck>,
}

impl AckBatch {
    /// Returns `true` if there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.checks.is_empty()
    }
}

/// Ordered buffer of pending outbox writes.
#[derive(Debug, Default)]
pub struct AckBuffer {
    writes: VecDeque<OutboxWrite>,
    checks: BTreeMap<i64, CompletionCheck>,
}

impl AckBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a write; returns the number of buffered writes.
    pub fn push(&mut self, write: OutboxWrite) -> usize {
        self.writes.push_back(write);
        self.writes.len()
    }

    /// Registers a completion check; a later check for the same row replaces
    /// an earlier one.
    pub fn track(&mut self, check: CompletionCheck) {
        self.checks.insert(check.outbox_id, check);
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Returns `true` if neither writes nor checks are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.checks.is_empty()
    }

    /// Drains the buffer.
    pub fn take(&mut self) -> AckBatch {
        AckBatch {
            writes: self.writes.drain(..).collect(),
            checks: std::mem::take(&mut self.checks).into_values().collect(),
        }
    }

    /// Puts a failed batch back ahead of anything queued since it was taken.
    pub fn requeue(&mut self, batch: AckBatch) {
        for write in batch.writes.into_iter().rev() {
            self.writes.push_front(write);
        }
        for check in batch.checks {
            self.checks.entry(check.outbox_id).or_insert(check);
        }
    }
}
