//! Event store database schema and statements.

/// Embedded migrations for the event log, snapshots and outbox tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Appends one event. Collides on `(aggregate_id, version)`.
pub const INSERT_EVENT: &str = r"
INSERT INTO events
    (event_id, aggregate_id, event_type, version, payload, occurred_at, correlation_id, user_id)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
";

/// Inserts or replaces a snapshot, never moving its version backwards.
pub const UPSERT_SNAPSHOT: &str = r"
INSERT INTO snapshots (aggregate_id, correlation_id, version, payload, updated_at)
VALUES ($1, $2, $3, $4, NOW())
ON CONFLICT (aggregate_id) DO UPDATE
SET correlation_id = EXCLUDED.correlation_id,
    version = EXCLUDED.version,
    payload = EXCLUDED.payload,
    updated_at = EXCLUDED.updated_at
WHERE snapshots.version < EXCLUDED.version
";

/// Inserts a pending outbox row.
pub const INSERT_OUTBOX: &str = r"
INSERT INTO outbox (aggregate_id, event_type, payload, status, retry_count, idempotency_key, occurred_at)
VALUES ($1, $2, $3, 'pending', 0, $4, $5)
";

/// Current snapshot version of one aggregate.
pub const SELECT_SNAPSHOT_VERSION: &str = r"
SELECT version FROM snapshots WHERE aggregate_id = $1
";

/// Full history of one aggregate, in version order.
pub const SELECT_EVENTS: &str = r"
SELECT event_id, aggregate_id, event_type, version, payload, occurred_at, correlation_id, user_id
FROM events
WHERE aggregate_id = $1
ORDER BY version ASC
";

/// Latest snapshot of one aggregate.
pub const SELECT_SNAPSHOT: &str = r"
SELECT aggregate_id, correlation_id, version, payload
FROM snapshots
WHERE aggregate_id = $1
";
