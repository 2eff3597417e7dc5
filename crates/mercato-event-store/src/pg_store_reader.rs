//! `PostgreSQL` implementation of the `StoreReader` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use mercato_core::error::DomainError;
use mercato_core::repository::{StoreReader, StoredEvent};
use mercato_core::snapshot::SnapshotRecord;

use crate::schema::{SELECT_EVENTS, SELECT_SNAPSHOT};

#[derive(FromRow)]
struct EventRow {
    event_id: Uuid,
    aggregate_id: Uuid,
    event_type: String,
    version: i64,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    correlation_id: Uuid,
    user_id: String,
}

impl From<EventRow> for StoredEvent {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            version: row.version,
            correlation_id: row.correlation_id,
            user_id: row.user_id,
            occurred_at: row.occurred_at,
        }
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    aggregate_id: Uuid,
    correlation_id: Uuid,
    version: i64,
    payload: serde_json::Value,
}

impl From<SnapshotRow> for SnapshotRecord {
    fn from(row: SnapshotRow) -> Self {
        Self {
            aggregate_id: row.aggregate_id,
            correlation_id: row.correlation_id,
            version: row.version,
            payload: row.payload,
        }
    }
}

/// PostgreSQL-backed reader for events and snapshots.
#[derive(Debug, Clone)]
pub struct PgStoreReader {
    pool: PgPool,
}

impl PgStoreReader {
    /// Creates a new `PgStoreReader`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn read_failure(what: &str, aggregate_id: Uuid, e: &sqlx::Error) -> DomainError {
    tracing::error!(error = %e, %aggregate_id, "failed to load {what}");
    DomainError::Infrastructure(format!("failed to load {what} for {aggregate_id}: {e}"))
}

#[async_trait]
impl StoreReader for PgStoreReader {
    async fn load_events(&self, aggregate_id: Uuid) -> Result<Vec<StoredEvent>, DomainError> {
        let rows: Vec<EventRow> = sqlx::query_as(SELECT_EVENTS)
            .bind(aggregate_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| read_failure("events", aggregate_id, &e))?;
        Ok(rows.into_iter().map(StoredEvent::from).collect())
    }

    async fn get_snapshot(&self, aggregate_id: Uuid) -> Result<Option<SnapshotRecord>, DomainError> {
        let row: Option<SnapshotRow> = sqlx::query_as(SELECT_SNAPSHOT)
            .bind(aggregate_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| read_failure("snapshot", aggregate_id, &e))?;
        Ok(row.map(SnapshotRecord::from))
    }
}
