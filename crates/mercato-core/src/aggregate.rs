//! Aggregate root abstraction.
//!
//! Every event-sourced aggregate embeds an [`AggregateKernel`], which owns
//! identity, version, correlation and the uncommitted event list, and
//! implements [`AggregateRoot`] on top of it. Mutating operations go through
//! [`AggregateKernel::record`]; replay goes through [`AggregateRoot::apply`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::clock::Clock;
use crate::command::CommandMetadata;
use crate::error::DomainError;
use crate::event::{DomainEvent, EventMetadata, StateTransition};
use crate::repository::StoredEvent;
use crate::snapshot::SnapshotRecord;

/// Version of an aggregate that has not applied any event yet.
///
/// The creation event carries version 0, so an aggregate at version `v` has
/// `v + 1` events in its history.
pub const EMPTY_VERSION: i64 = -1;

/// Trait for aggregate roots that reconstitute from event history or snapshots.
pub trait AggregateRoot: Send + Sync + Sized {
    /// Aggregate type name, used for logging.
    const AGGREGATE_TYPE: &'static str;

    /// Full business state; `Default` is the empty state replay starts from.
    type State: Clone + Default + Serialize + DeserializeOwned + Send + Sync;

    /// The event type this aggregate produces and consumes.
    type Event: DomainEvent<State = Self::State>;

    /// Builds an aggregate directly from persisted parts.
    fn from_parts(id: Uuid, correlation_id: Uuid, version: i64, state: Self::State) -> Self;

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> Uuid;

    /// Returns the current version.
    fn version(&self) -> i64;

    /// Returns the correlation ID of the latest recorded or applied event.
    fn correlation_id(&self) -> Uuid;

    /// Returns the current business state.
    fn state(&self) -> &Self::State;

    /// Apply a persisted event to mutate internal state (used during
    /// reconstitution). Never validates business rules.
    fn apply(&mut self, event: &Self::Event);

    /// Returns uncommitted events produced by command handling.
    fn uncommitted_events(&self) -> &[Self::Event];

    /// Clears uncommitted events after persistence.
    fn clear_uncommitted_events(&mut self);

    /// Serializes the current state into a snapshot record.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the state cannot be serialized.
    fn to_snapshot(&self) -> Result<SnapshotRecord, DomainError> {
        let payload = serde_json::to_value(self.state()).map_err(|e| {
            DomainError::Infrastructure(format!("snapshot serialization failed: {e}"))
        })?;
        Ok(SnapshotRecord {
            aggregate_id: self.aggregate_id(),
            correlation_id: self.correlation_id(),
            version: self.version(),
            payload,
        })
    }

    /// Restores an aggregate from a snapshot without replaying events.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the payload does not decode.
    fn load_from_snapshot(snapshot: &SnapshotRecord) -> Result<Self, DomainError> {
        let state: Self::State = serde_json::from_value(snapshot.payload.clone()).map_err(|e| {
            DomainError::Infrastructure(format!(
                "snapshot deserialization failed for {}: {e}",
                snapshot.aggregate_id
            ))
        })?;
        Ok(Self::from_parts(
            snapshot.aggregate_id,
            snapshot.correlation_id,
            snapshot.version,
            state,
        ))
    }
}

/// Shared aggregate bookkeeping: identity, version and uncommitted events.
#[derive(Debug, Clone)]
pub struct AggregateKernel<S, E> {
    id: Uuid,
    version: i64,
    correlation_id: Uuid,
    state: S,
    uncommitted_events: Vec<E>,
}

impl<S, E> AggregateKernel<S, E>
where
    S: Clone + Default,
    E: DomainEvent<State = S>,
{
    /// Creates a kernel at [`EMPTY_VERSION`] with the empty state.
    #[must_use]
    pub fn empty(id: Uuid) -> Self {
        Self::from_parts(id, Uuid::nil(), EMPTY_VERSION, S::default())
    }

    /// Creates a kernel from persisted parts.
    #[must_use]
    pub fn from_parts(id: Uuid, correlation_id: Uuid, version: i64, state: S) -> Self {
        Self {
            id,
            version,
            correlation_id,
            state,
            uncommitted_events: Vec::new(),
        }
    }

    /// Returns the aggregate identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the current version.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Returns the current correlation ID.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Returns the current business state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Returns `true` if nothing has been recorded or applied yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.version == EMPTY_VERSION
    }

    /// Records one state transition as a new uncommitted event.
    ///
    /// Captures the prior state, runs `mutate`, advances the version by one,
    /// captures the new state and wraps both with fresh metadata via `wrap`.
    /// Callers validate preconditions before calling this.
    pub fn record(
        &mut self,
        event_type: &'static str,
        command: &CommandMetadata,
        clock: &dyn Clock,
        mutate: impl FnOnce(&mut S),
        wrap: impl FnOnce(EventMetadata, StateTransition<S>) -> E,
    ) -> &E {
        let prior_state = self.state.clone();
        mutate(&mut self.state);
        self.version += 1;
        self.correlation_id = command.correlation_id;

        let metadata = EventMetadata {
            event_id: Uuid::now_v7(),
            event_type: event_type.to_owned(),
            aggregate_id: self.id,
            version: self.version,
            correlation_id: command.correlation_id,
            user_id: command.user_id.clone(),
            occurred_at: clock.now_stored(),
        };
        let event = wrap(
            metadata,
            StateTransition::new(prior_state, self.state.clone()),
        );
        self.uncommitted_events.push(event);
        let last = self.uncommitted_events.len() - 1;
        &self.uncommitted_events[last]
    }

    /// Moves the kernel to the state described by a persisted event.
    pub fn apply_transition(&mut self, metadata: &EventMetadata, transition: &StateTransition<S>) {
        self.state = transition.new_state.clone();
        self.version = metadata.version;
        self.correlation_id = metadata.correlation_id;
    }

    /// Returns uncommitted events.
    #[must_use]
    pub fn uncommitted_events(&self) -> &[E] {
        &self.uncommitted_events
    }

    /// Clears uncommitted events.
    pub fn clear_uncommitted_events(&mut self) {
        self.uncommitted_events.clear();
    }
}

/// Reconstitutes an aggregate by replaying its full event history from the
/// empty state.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if `events` is empty and
/// `DomainError::Infrastructure` if versions are not consecutive from 0 or an
/// event fails to decode.
pub fn rehydrate<A: AggregateRoot>(
    aggregate_id: Uuid,
    events: &[StoredEvent],
) -> Result<A, DomainError> {
    if events.is_empty() {
        return Err(DomainError::AggregateNotFound(aggregate_id));
    }

    let mut aggregate = A::from_parts(aggregate_id, Uuid::nil(), EMPTY_VERSION, A::State::default());
    for stored in events {
        let expected = aggregate.version() + 1;
        if stored.version != expected {
            return Err(DomainError::Infrastructure(format!(
                "event history of {} {aggregate_id} is out of order: expected version {expected}, found {}",
                A::AGGREGATE_TYPE,
                stored.version
            )));
        }
        let event = A::Event::from_stored(stored)?;
        aggregate.apply(&event);
    }
    tracing::debug!(
        aggregate_type = A::AGGREGATE_TYPE,
        %aggregate_id,
        version = aggregate.version(),
        "rehydrated aggregate from event history"
    );
    Ok(aggregate)
}

/// Compares a command's expected version with the stored snapshot version.
///
/// # Errors
///
/// Returns `DomainError::ConcurrencyConflict` when they differ.
pub fn check_expected_version(snapshot: &SnapshotRecord, expected: i64) -> Result<(), DomainError> {
    if snapshot.version == expected {
        Ok(())
    } else {
        Err(DomainError::ConcurrencyConflict {
            aggregate_id: snapshot.aggregate_id,
            expected,
            actual: snapshot.version,
        })
    }
}
