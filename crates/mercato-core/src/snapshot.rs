//! Snapshot record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Denormalized latest state of one aggregate.
///
/// One record per aggregate, overwritten on every command. `version` equals
/// the version of the last event appended for the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Aggregate identifier (primary key).
    pub aggregate_id: Uuid,
    /// Correlation ID of the command that produced this state.
    pub correlation_id: Uuid,
    /// Version of the last applied event.
    pub version: i64,
    /// Serialized aggregate business state.
    pub payload: serde_json::Value,
}
