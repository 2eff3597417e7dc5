//! Integration event handlers wired into the outbox at startup.

use std::sync::Arc;

use async_trait::async_trait;
use mercato_catalog::domain::events::CATALOG_EVENT_TYPES;
use mercato_core::error::{DomainError, HandlerError};
use mercato_outbox::registry::{HandlerRegistry, IntegrationEventHandler};

/// Identity of [`AuditLogHandler`] in processing records.
pub const AUDIT_LOG_HANDLER_ID: &str = "audit-log";

/// Writes every catalog integration event to the structured log.
#[derive(Debug, Default)]
pub struct AuditLogHandler;

#[async_trait]
impl IntegrationEventHandler for AuditLogHandler {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError> {
        let field = |name: &str| payload.get(name).and_then(serde_json::Value::as_str);
        let event_type = field("event_type")
            .ok_or_else(|| HandlerError::Permanent("payload has no event_type".to_owned()))?;

        tracing::info!(
            event_type,
            aggregate_id = field("aggregate_id").unwrap_or_default(),
            correlation_id = field("correlation_id").unwrap_or_default(),
            user_id = field("user_id").unwrap_or_default(),
            version = payload.get("version").and_then(serde_json::Value::as_i64),
            "catalog event"
        );
        Ok(())
    }
}

/// Builds the registry the poller dispatches through.
///
/// # Errors
///
/// Returns `DomainError::Validation` on a duplicate registration.
pub fn build_registry() -> Result<HandlerRegistry, DomainError> {
    let mut registry = HandlerRegistry::new();
    let audit: Arc<dyn IntegrationEventHandler> = Arc::new(AuditLogHandler);
    for event_type in CATALOG_EVENT_TYPES {
        registry.register(event_type, AUDIT_LOG_HANDLER_ID, Arc::clone(&audit))?;
    }
    Ok(registry)
}
