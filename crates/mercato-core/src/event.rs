//! Domain event abstractions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::repository::StoredEvent;

/// Metadata attached to every domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Type name for deserialization routing (e.g. `product.created`).
    pub event_type: String,
    /// Aggregate/stream this event belongs to.
    pub aggregate_id: Uuid,
    /// The aggregate version this event produces.
    pub version: i64,
    /// Correlation ID grouping every event caused by one originating request.
    pub correlation_id: Uuid,
    /// The actor that issued the command.
    pub user_id: String,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

/// The full business state of an aggregate before and after one event.
///
/// Creation events carry the empty (`Default`) state as `prior_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition<S> {
    /// State before the event.
    pub prior_state: S,
    /// State after the event.
    pub new_state: S,
}

impl<S> StateTransition<S> {
    /// Creates a transition from `prior_state` to `new_state`.
    pub fn new(prior_state: S, new_state: S) -> Self {
        Self {
            prior_state,
            new_state,
        }
    }
}

/// Trait that all domain events implement.
pub trait DomainEvent: Send + Sync + Clone + std::fmt::Debug {
    /// The aggregate business state carried by the event payload.
    type State;

    /// Returns the event type name (used for serialization routing).
    fn event_type(&self) -> &'static str;

    /// Returns the metadata for this event.
    fn metadata(&self) -> &EventMetadata;

    /// Returns the prior/new state pair carried by this event.
    fn transition(&self) -> &StateTransition<Self::State>;

    /// Serializes the event payload to JSON.
    fn to_payload(&self) -> serde_json::Value;

    /// Decodes a persisted event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the payload does not decode.
    fn from_stored(stored: &StoredEvent) -> Result<Self, DomainError>;

    /// Converts the event into its persisted row shape.
    fn to_stored(&self) -> StoredEvent {
        let meta = self.metadata();
        StoredEvent {
            event_id: meta.event_id,
            aggregate_id: meta.aggregate_id,
            event_type: self.event_type().to_owned(),
            payload: self.to_payload(),
            version: meta.version,
            correlation_id: meta.correlation_id,
            user_id: meta.user_id.clone(),
            occurred_at: meta.occurred_at,
        }
    }
}

impl EventMetadata {
    /// Rebuilds the metadata of a persisted event.
    #[must_use]
    pub fn from_stored(stored: &StoredEvent) -> Self {
        Self {
            event_id: stored.event_id,
            event_type: stored.event_type.clone(),
            aggregate_id: stored.aggregate_id,
            version: stored.version,
            correlation_id: stored.correlation_id,
            user_id: stored.user_id.clone(),
            occurred_at: stored.occurred_at,
        }
    }
}
