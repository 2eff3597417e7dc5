//! Integration event handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mercato_core::error::{DomainError, HandlerError};

/// A consumer of integration events.
#[async_trait]
pub trait IntegrationEventHandler: Send + Sync {
    /// Handles one event payload.
    ///
    /// # Errors
    ///
    /// Returns a `HandlerError`; its classification decides between retry
    /// and dead-letter.
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError>;
}

/// A handler bound to its identity.
#[derive(Clone)]
pub struct RegisteredHandler {
    /// Stable handler identity; part of every idempotency key.
    pub handler_id: String,
    /// The handler itself.
    pub handler: Arc<dyn IntegrationEventHandler>,
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("handler_id", &self.handler_id)
            .finish_non_exhaustive()
    }
}

/// Handlers per event type, built once at startup and shared with the poller.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<RegisteredHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type` under `handler_id`.
    ///
    /// Several handlers may share an event type; each must finish before the
    /// outbox row is removed.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `handler_id` is empty or already
    /// registered for `event_type`.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler_id: impl Into<String>,
        handler: Arc<dyn IntegrationEventHandler>,
    ) -> Result<(), DomainError> {
        let event_type = event_type.into();
        let handler_id = handler_id.into();
        if handler_id.trim().is_empty() {
            return Err(DomainError::Validation(
                "handler id must not be empty".to_owned(),
            ));
        }

        let registered = self.handlers.entry(event_type.clone()).or_default();
        if registered.iter().any(|h| h.handler_id == handler_id) {
            return Err(DomainError::Validation(format!(
                "handler {handler_id} is already registered for {event_type}"
            )));
        }
        tracing::info!(%event_type, %handler_id, "registered outbox handler");
        registered.push(RegisteredHandler {
            handler_id,
            handler,
        });
        Ok(())
    }

    /// Handlers for `event_type`, in registration order.
    #[must_use]
    pub fn handlers_for(&self, event_type: &str) -> &[RegisteredHandler] {
        self.handlers.get(event_type).map_or(&[], Vec::as_slice)
    }

    /// Total number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
