//! `PostgreSQL` implementation of the `OutboxStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use mercato_core::error::DomainError;
use mercato_core::outbox::{
    CompletionCheck, DeadLetterRecord, DeliveryStatus, OutboxRecord, OutboxStore, OutboxWrite,
    ProcessingRecord,
};

const SELECT_PENDING: &str = "\
    SELECT id, aggregate_id, event_type, payload, status, retry_count, \
           last_attempt_at, next_retry_at, idempotency_key, occurred_at \
    FROM outbox \
    WHERE status <> 'completed' AND (next_retry_at IS NULL OR next_retry_at <= $2) \
    ORDER BY id \
    LIMIT $1";

const SELECT_PROCESSING: &str = "\
    SELECT id, outbox_id, handler_id, idempotency_key, status, retry_count, \
           last_attempt_at, next_retry_at, processed_at \
    FROM outbox_processing \
    WHERE idempotency_key = $1";

// A claim for a row that is already gone, or for a dead-lettered handler,
// inserts nothing; a completed record is never reopened.
const CLAIM_PROCESSING: &str = "\
    INSERT INTO outbox_processing \
        (outbox_id, handler_id, idempotency_key, status, retry_count, last_attempt_at) \
    SELECT $1, $2, $3, 'processing', 0, $4 \
    WHERE EXISTS (SELECT 1 FROM outbox WHERE id = $1) \
      AND NOT EXISTS (SELECT 1 FROM outbox_dlq WHERE outbox_id = $1 AND handler_id = $2) \
    ON CONFLICT (idempotency_key) DO UPDATE \
        SET status = 'processing', last_attempt_at = EXCLUDED.last_attempt_at \
        WHERE outbox_processing.status <> 'completed'";

const CLAIM_OUTBOX: &str = "\
    UPDATE outbox SET status = 'processing', last_attempt_at = $2 WHERE id = $1";

const COMPLETE_PROCESSING: &str = "\
    UPDATE outbox_processing \
    SET status = 'completed', processed_at = $2, next_retry_at = NULL \
    WHERE idempotency_key = $1";

const RETRY_PROCESSING: &str = "\
    UPDATE outbox_processing \
    SET status = 'failed', retry_count = $2, next_retry_at = $3, last_attempt_at = $4 \
    WHERE idempotency_key = $1 AND status <> 'completed'";

const RETRY_OUTBOX: &str = "\
    UPDATE outbox \
    SET status = 'failed', \
        retry_count = GREATEST(retry_count, $2), \
        next_retry_at = LEAST(COALESCE(next_retry_at, $3), $3), \
        last_attempt_at = $4 \
    WHERE id = $1";

const DELETE_PROCESSING: &str = "DELETE FROM outbox_processing WHERE idempotency_key = $1";

const MARK_OUTBOX_COMPLETED: &str = "UPDATE outbox SET status = 'completed' WHERE id = $1";

// True when every expected handler has a completed processing record or a
// dead letter for the row.
const IS_SETTLED: &str = "\
    SELECT EXISTS (SELECT 1 FROM outbox WHERE id = $1) \
       AND NOT EXISTS ( \
        SELECT 1 FROM UNNEST($2::text[], $3::text[]) AS h(handler_id, idempotency_key) \
        WHERE NOT EXISTS ( \
                SELECT 1 FROM outbox_processing p \
                WHERE p.idempotency_key = h.idempotency_key AND p.status = 'completed') \
          AND NOT EXISTS ( \
                SELECT 1 FROM outbox_dlq d \
                WHERE d.outbox_id = $1 AND d.handler_id = h.handler_id))";

// Processing rows go with their outbox row (ON DELETE CASCADE).
const DELETE_OUTBOX: &str = "DELETE FROM outbox WHERE id = ANY($1) RETURNING id";

const INSERT_DEAD_LETTER: &str = "\
    INSERT INTO outbox_dlq \
        (outbox_id, handler_id, event_type, payload, error_message, \
         final_retry_count, failed_at, original_occurred_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

const IS_DEAD_LETTERED: &str = "\
    SELECT EXISTS (SELECT 1 FROM outbox_dlq WHERE outbox_id = $1 AND handler_id = $2)";

const SELECT_DEAD_LETTERS: &str = "\
    SELECT outbox_id, handler_id, event_type, payload, error_message, \
           final_retry_count, failed_at, original_occurred_at \
    FROM outbox_dlq \
    ORDER BY id DESC \
    LIMIT $1";

#[derive(FromRow)]
struct OutboxRow {
    id: i64,
    aggregate_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    retry_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    idempotency_key: String,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = DomainError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status: DeliveryStatus::parse(&row.status)?,
            retry_count: row.retry_count,
            last_attempt_at: row.last_attempt_at,
            next_retry_at: row.next_retry_at,
            idempotency_key: row.idempotency_key,
            occurred_at: row.occurred_at,
        })
    }
}

#[derive(FromRow)]
struct ProcessingRow {
    id: i64,
    outbox_id: i64,
    handler_id: String,
    idempotency_key: String,
    status: String,
    retry_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ProcessingRow> for ProcessingRecord {
    type Error = DomainError;

    fn try_from(row: ProcessingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            outbox_id: row.outbox_id,
            handler_id: row.handler_id,
            idempotency_key: row.idempotency_key,
            status: DeliveryStatus::parse(&row.status)?,
            retry_count: row.retry_count,
            last_attempt_at: row.last_attempt_at,
            next_retry_at: row.next_retry_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(FromRow)]
struct DeadLetterRow {
    outbox_id: i64,
    handler_id: String,
    event_type: String,
    payload: serde_json::Value,
    error_message: String,
    final_retry_count: i32,
    failed_at: DateTime<Utc>,
    original_occurred_at: DateTime<Utc>,
}

impl From<DeadLetterRow> for DeadLetterRecord {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            outbox_id: row.outbox_id,
            handler_id: row.handler_id,
            event_type: row.event_type,
            payload: row.payload,
            error_message: row.error_message,
            final_retry_count: row.final_retry_count,
            failed_at: row.failed_at,
            original_occurred_at: row.original_occurred_at,
        }
    }
}

/// PostgreSQL-backed outbox storage.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Creates a new `PgOutboxStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn infrastructure(what: &str, e: &sqlx::Error) -> DomainError {
    tracing::error!(error = %e, "outbox store: {what} failed");
    DomainError::Infrastructure(format!("{what} failed: {e}"))
}

async fn apply_write(conn: &mut PgConnection, write: &OutboxWrite) -> Result<(), sqlx::Error> {
    match write {
        OutboxWrite::Claim {
            outbox_id,
            handler_id,
            idempotency_key,
            attempted_at,
        } => {
            sqlx::query(CLAIM_PROCESSING)
                .bind(outbox_id)
                .bind(handler_id)
                .bind(idempotency_key)
                .bind(attempted_at)
                .execute(&mut *conn)
                .await?;
            sqlx::query(CLAIM_OUTBOX)
                .bind(outbox_id)
                .bind(attempted_at)
                .execute(&mut *conn)
                .await?;
        }
        OutboxWrite::Completed {
            idempotency_key,
            processed_at,
            ..
        } => {
            sqlx::query(COMPLETE_PROCESSING)
                .bind(idempotency_key)
                .bind(processed_at)
                .execute(&mut *conn)
                .await?;
        }
        OutboxWrite::Retry {
            outbox_id,
            idempotency_key,
            retry_count,
            next_retry_at,
            attempted_at,
        } => {
            sqlx::query(RETRY_PROCESSING)
                .bind(idempotency_key)
                .bind(retry_count)
                .bind(next_retry_at)
                .bind(attempted_at)
                .execute(&mut *conn)
                .await?;
            sqlx::query(RETRY_OUTBOX)
                .bind(outbox_id)
                .bind(retry_count)
                .bind(next_retry_at)
                .bind(attempted_at)
                .execute(&mut *conn)
                .await?;
        }
        OutboxWrite::Failed {
            idempotency_key, ..
        } => {
            sqlx::query(DELETE_PROCESSING)
                .bind(idempotency_key)
                .execute(&mut *conn)
                .await?;
        }
        OutboxWrite::MarkCompleted { outbox_id } => {
            sqlx::query(MARK_OUTBOX_COMPLETED)
                .bind(outbox_id)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_pending(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, DomainError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(SELECT_PENDING)
            .bind(limit)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| infrastructure("fetching pending outbox rows", &e))?;
        rows.into_iter().map(OutboxRecord::try_from).collect()
    }

    async fn find_processing(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ProcessingRecord>, DomainError> {
        let row: Option<ProcessingRow> = sqlx::query_as(SELECT_PROCESSING)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| infrastructure("loading processing record", &e))?;
        row.map(ProcessingRecord::try_from).transpose()
    }

    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), DomainError> {
        sqlx::query(INSERT_DEAD_LETTER)
            .bind(record.outbox_id)
            .bind(&record.handler_id)
            .bind(&record.event_type)
            .bind(&record.payload)
            .bind(&record.error_message)
            .bind(record.final_retry_count)
            .bind(record.failed_at)
            .bind(record.original_occurred_at)
            .execute(&self.pool)
            .await
            .map_err(|e| infrastructure("inserting dead letter", &e))?;
        Ok(())
    }

    async fn is_dead_lettered(
        &self,
        outbox_id: i64,
        handler_id: &str,
    ) -> Result<bool, DomainError> {
        sqlx::query_scalar(IS_DEAD_LETTERED)
            .bind(outbox_id)
            .bind(handler_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| infrastructure("looking up dead letter", &e))
    }

    async fn apply(
        &self,
        writes: &[OutboxWrite],
        checks: &[CompletionCheck],
    ) -> Result<Vec<i64>, DomainError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            tracing::error!(error = %e, "failed to begin outbox flush");
            DomainError::PhysicalCommitFailure(e.to_string())
        })?;
        let conn: &mut PgConnection = &mut tx;

        for write in writes {
            apply_write(&mut *conn, write)
                .await
                .map_err(|e| infrastructure("applying outbox write", &e))?;
        }

        // Every check is settled before anything is deleted, so rows sharing
        // a payload still see each other's processing records.
        let mut settled = Vec::new();
        for check in checks {
            let (handler_ids, keys): (Vec<String>, Vec<String>) = check
                .handlers
                .iter()
                .map(|h| (h.handler_id.clone(), h.idempotency_key.clone()))
                .unzip();
            let is_settled: bool = sqlx::query_scalar(IS_SETTLED)
                .bind(check.outbox_id)
                .bind(handler_ids)
                .bind(keys)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| infrastructure("checking outbox completion", &e))?;
            if is_settled {
                settled.push(check.outbox_id);
            }
        }

        let deleted: Vec<i64> = if settled.is_empty() {
            Vec::new()
        } else {
            sqlx::query_scalar(DELETE_OUTBOX)
                .bind(&settled)
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| infrastructure("deleting settled outbox rows", &e))?
        };

        tx.commit().await.map_err(|e| {
            tracing::error!(error = %e, "failed to commit outbox flush");
            DomainError::PhysicalCommitFailure(e.to_string())
        })?;
        Ok(deleted)
    }

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterRecord>, DomainError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(SELECT_DEAD_LETTERS)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| infrastructure("listing dead letters", &e))?;
        Ok(rows.into_iter().map(DeadLetterRecord::from).collect())
    }
}
