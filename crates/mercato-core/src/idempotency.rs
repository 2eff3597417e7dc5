//! Deterministic idempotency keys.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Key of the processing record for `handler_id` handling `payload`.
///
/// `serde_json::Value` objects keep their keys sorted, so equal payloads
/// always serialize to the same bytes.
#[must_use]
pub fn idempotency_key(payload: &serde_json::Value, handler_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(handler_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Key of the outbox row emitted for one domain event.
#[must_use]
pub fn outbox_idempotency_key(aggregate_id: Uuid, version: i64, event_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(aggregate_id.as_bytes());
    hasher.update(version.to_be_bytes());
    hasher.update(event_type.as_bytes());
    format!("{:x}", hasher.finalize())
}
