//! Shared test helpers for outbox poller tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mercato_core::clock::Clock;
use mercato_core::error::HandlerError;
use mercato_core::outbox::NewOutboxMessage;
use mercato_outbox::config::PollerConfig;
use mercato_outbox::poller::OutboxPoller;
use mercato_outbox::registry::{HandlerRegistry, IntegrationEventHandler};
use mercato_test_support::{InMemoryStore, ManualClock};
use uuid::Uuid;

pub const PRODUCT_CREATED: &str = "product.created";

/// Build an outbox message for `event_type` with the given payload.
pub fn message(event_type: &str, payload: serde_json::Value) -> NewOutboxMessage {
    NewOutboxMessage {
        aggregate_id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        payload,
        idempotency_key: Uuid::new_v4().to_string(),
        occurred_at: Utc::now(),
    }
}

/// Records the clock time of every invocation.
pub struct RecordingHandler {
    clock: Arc<ManualClock>,
    calls: Mutex<Vec<DateTime<Utc>>>,
}

impl RecordingHandler {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<DateTime<Utc>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl IntegrationEventHandler for RecordingHandler {
    async fn handle(&self, _payload: &serde_json::Value) -> Result<(), HandlerError> {
        self.calls.lock().unwrap().push(self.clock.now());
        Ok(())
    }
}

/// Fails with a retryable error a fixed number of times, then succeeds.
pub struct FlakyHandler {
    inner: RecordingHandler,
    failures: usize,
}

impl FlakyHandler {
    pub fn new(clock: Arc<ManualClock>, failures: usize) -> Self {
        Self {
            inner: RecordingHandler::new(clock),
            failures,
        }
    }

    pub fn calls(&self) -> Vec<DateTime<Utc>> {
        self.inner.calls()
    }

    pub fn call_count(&self) -> usize {
        self.inner.call_count()
    }
}

#[async_trait]
impl IntegrationEventHandler for FlakyHandler {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError> {
        let attempt = self.inner.call_count();
        self.inner.handle(payload).await?;
        if attempt < self.failures {
            return Err(HandlerError::Retryable(format!(
                "upstream unavailable (attempt {attempt})"
            )));
        }
        Ok(())
    }
}

/// Always fails with the same error.
pub struct FailingHandler {
    error: HandlerError,
    calls: AtomicUsize,
}

impl FailingHandler {
    pub fn new(error: HandlerError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationEventHandler for FailingHandler {
    async fn handle(&self, _payload: &serde_json::Value) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// One registration: event type, handler id and handler.
pub type Route = (&'static str, &'static str, Arc<dyn IntegrationEventHandler>);

pub fn route(
    event_type: &'static str,
    handler_id: &'static str,
    handler: Arc<dyn IntegrationEventHandler>,
) -> Route {
    (event_type, handler_id, handler)
}

/// Store, clock and poller wired together.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub poller: OutboxPoller,
}

/// Build a poller over an in-memory store with the given registrations.
pub fn harness_with(
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
    config: PollerConfig,
    routes: Vec<Route>,
) -> Harness {
    let mut registry = HandlerRegistry::new();
    for (event_type, handler_id, handler) in routes {
        registry.register(event_type, handler_id, handler).unwrap();
    }
    let poller = OutboxPoller::new(
        store.clone(),
        Arc::new(registry),
        clock.clone(),
        config,
    );
    Harness {
        store,
        clock,
        poller,
    }
}
