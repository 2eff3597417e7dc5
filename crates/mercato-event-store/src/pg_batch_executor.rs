//! `PostgreSQL` implementation of the `BatchExecutor` trait.
//!
//! A cohort runs inside one `BEGIN ... COMMIT`. Each batch gets its own
//! `SAVEPOINT`, so a batch whose statements fail (typically a primary-key
//! collision on `events` from a concurrent writer) is rolled back alone
//! while the rest of the cohort still commits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mercato_core::error::DomainError;
use mercato_core::repository::{BatchExecutor, PendingWrite};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{Executor, PgConnection, PgPool, Postgres};
use uuid::Uuid;

use crate::schema::{INSERT_EVENT, INSERT_OUTBOX, SELECT_SNAPSHOT_VERSION, UPSERT_SNAPSHOT};

/// A bound parameter of a prepared write.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// `UUID` column.
    Uuid(Uuid),
    /// `VARCHAR`/`TEXT` column.
    Text(String),
    /// `BIGINT` column.
    BigInt(i64),
    /// `JSONB` column.
    Json(serde_json::Value),
    /// `TIMESTAMPTZ` column.
    Timestamp(DateTime<Utc>),
}

/// A pending write rendered as a statement plus its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedWrite {
    /// Parameterized SQL.
    pub statement: &'static str,
    /// Positional parameters.
    pub params: Vec<SqlParam>,
    /// Write kind, for logging and error mapping.
    pub kind: &'static str,
}

impl From<&PendingWrite> for PreparedWrite {
    fn from(write: &PendingWrite) -> Self {
        match write {
            PendingWrite::AppendEvent(event) => Self {
                statement: INSERT_EVENT,
                params: vec![
                    SqlParam::Uuid(event.event_id),
                    SqlParam::Uuid(event.aggregate_id),
                    SqlParam::Text(event.event_type.clone()),
                    SqlParam::BigInt(event.version),
                    SqlParam::Json(event.payload.clone()),
                    SqlParam::Timestamp(event.occurred_at),
                    SqlParam::Uuid(event.correlation_id),
                    SqlParam::Text(event.user_id.clone()),
                ],
                kind: write.kind(),
            },
            PendingWrite::SaveSnapshot(snapshot) => Self {
                statement: UPSERT_SNAPSHOT,
                params: vec![
                    SqlParam::Uuid(snapshot.aggregate_id),
                    SqlParam::Uuid(snapshot.correlation_id),
                    SqlParam::BigInt(snapshot.version),
                    SqlParam::Json(snapshot.payload.clone()),
                ],
                kind: write.kind(),
            },
            PendingWrite::EnqueueOutbox(message) => Self {
                statement: INSERT_OUTBOX,
                params: vec![
                    SqlParam::Uuid(message.aggregate_id),
                    SqlParam::Text(message.event_type.clone()),
                    SqlParam::Json(message.payload.clone()),
                    SqlParam::Text(message.idempotency_key.clone()),
                    SqlParam::Timestamp(message.occurred_at),
                ],
                kind: write.kind(),
            },
        }
    }
}

impl PreparedWrite {
    fn query(&self) -> Query<'_, Postgres, PgArguments> {
        self.params
            .iter()
            .fold(sqlx::query(self.statement), |query, param| match param {
                SqlParam::Uuid(value) => query.bind(*value),
                SqlParam::Text(value) => query.bind(value.clone()),
                SqlParam::BigInt(value) => query.bind(*value),
                SqlParam::Json(value) => query.bind(value.clone()),
                SqlParam::Timestamp(value) => query.bind(*value),
            })
    }
}

/// PostgreSQL-backed batch executor.
#[derive(Debug, Clone)]
pub struct PgBatchExecutor {
    pool: PgPool,
}

impl PgBatchExecutor {
    /// Creates a new `PgBatchExecutor`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn commit_failure(stage: &str, e: &sqlx::Error) -> DomainError {
    DomainError::PhysicalCommitFailure(format!("{stage}: {e}"))
}

/// Maps a statement failure to the domain taxonomy.
fn statement_failure(write: &PendingWrite, e: &sqlx::Error) -> DomainError {
    let unique_violation = e
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    match write {
        PendingWrite::AppendEvent(event) if unique_violation => DomainError::ConcurrencyConflict {
            aggregate_id: event.aggregate_id,
            expected: event.version - 1,
            actual: event.version,
        },
        _ => DomainError::Infrastructure(format!("{} failed: {e}", write.kind())),
    }
}

/// Runs the statements of one batch; stops at the first failure.
async fn execute_batch(conn: &mut PgConnection, batch: &[PendingWrite]) -> Result<(), DomainError> {
    for write in batch {
        let prepared = PreparedWrite::from(write);
        let result = prepared
            .query()
            .execute(&mut *conn)
            .await
            .map_err(|e| statement_failure(write, &e))?;

        let PendingWrite::SaveSnapshot(snapshot) = write else {
            continue;
        };
        if result.rows_affected() == 0 {
            // The upsert only overwrites older versions.
            let actual: i64 = sqlx::query_scalar(SELECT_SNAPSHOT_VERSION)
                .bind(snapshot.aggregate_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| statement_failure(write, &e))?;
            return Err(DomainError::ConcurrencyConflict {
                aggregate_id: snapshot.aggregate_id,
                expected: snapshot.version - 1,
                actual,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl BatchExecutor for PgBatchExecutor {
    async fn execute(
        &self,
        cohort: &[Vec<PendingWrite>],
    ) -> Result<Vec<Result<(), DomainError>>, DomainError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| commit_failure("begin", &e))?;
        let conn: &mut PgConnection = &mut tx;
        let mut results = Vec::with_capacity(cohort.len());

        for (index, batch) in cohort.iter().enumerate() {
            let savepoint = format!("batch_{index}");
            conn
                .execute(sqlx::raw_sql(&format!("SAVEPOINT {savepoint}")))
                .await
                .map_err(|e| commit_failure("savepoint", &e))?;

            match execute_batch(&mut *conn, batch).await {
                Ok(()) => {
                    conn
                        .execute(sqlx::raw_sql(&format!("RELEASE SAVEPOINT {savepoint}")))
                        .await
                        .map_err(|e| commit_failure("release savepoint", &e))?;
                    results.push(Ok(()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, batch = index, "rolling back write batch");
                    conn
                        .execute(sqlx::raw_sql(&format!("ROLLBACK TO SAVEPOINT {savepoint}")))
                        .await
                        .map_err(|e| commit_failure("rollback to savepoint", &e))?;
                    results.push(Err(e));
                }
            }
        }

        tx.commit().await.map_err(|e| commit_failure("commit", &e))?;
        Ok(results)
    }
}
