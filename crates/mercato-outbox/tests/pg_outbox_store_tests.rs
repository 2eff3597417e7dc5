//! Integration tests for `PgOutboxStore`.
//!
//! These need a PostgreSQL instance reachable through `DATABASE_URL`; run
//! them with `cargo test -- --ignored`.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use mercato_core::outbox::{
    CompletionCheck, DeadLetterRecord, DeliveryStatus, ExpectedHandler, OutboxStore, OutboxWrite,
};
use mercato_outbox::pg_outbox_store::PgOutboxStore;
use sqlx::PgPool;
use uuid::Uuid;

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

async fn insert_outbox(pool: &PgPool, event_type: &str, key: &str) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO outbox (aggregate_id, event_type, payload, idempotency_key, occurred_at) \
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(event_type)
    .bind(serde_json::json!({"key": key}))
    .bind(key)
    .bind(now())
    .fetch_one(pool)
    .await
    .unwrap()
}

fn claim(outbox_id: i64, handler_id: &str, key: &str, at: DateTime<Utc>) -> OutboxWrite {
    OutboxWrite::Claim {
        outbox_id,
        handler_id: handler_id.to_string(),
        idempotency_key: key.to_string(),
        attempted_at: at,
    }
}

fn check(outbox_id: i64, handlers: &[(&str, &str)]) -> CompletionCheck {
    CompletionCheck {
        outbox_id,
        handlers: handlers
            .iter()
            .map(|(handler_id, key)| ExpectedHandler {
                handler_id: (*handler_id).to_string(),
                idempotency_key: (*key).to_string(),
            })
            .collect(),
    }
}

fn dead_letter(outbox_id: i64, handler_id: &str) -> DeadLetterRecord {
    DeadLetterRecord {
        outbox_id,
        handler_id: handler_id.to_string(),
        event_type: "product.created".to_string(),
        payload: serde_json::json!({}),
        error_message: "customer not found".to_string(),
        final_retry_count: 0,
        failed_at: now(),
        original_occurred_at: now(),
    }
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_fetch_pending_returns_due_rows_in_id_order(pool: PgPool) {
    // Arrange
    let store = PgOutboxStore::new(pool.clone());
    let t = now();
    let first = insert_outbox(&pool, "product.created", "k1").await;
    let later = insert_outbox(&pool, "product.created", "k2").await;
    let third = insert_outbox(&pool, "product.created", "k3").await;
    let done = insert_outbox(&pool, "product.created", "k4").await;
    store
        .apply(
            &[
                claim(later, "h", "later-h", t),
                OutboxWrite::Retry {
                    outbox_id: later,
                    idempotency_key: "later-h".to_string(),
                    retry_count: 1,
                    next_retry_at: t + Duration::seconds(30),
                    attempted_at: t,
                },
                OutboxWrite::MarkCompleted { outbox_id: done },
            ],
            &[],
        )
        .await
        .unwrap();

    // Act
    let rows = store.fetch_pending(10, t).await.unwrap();

    // Assert
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![first, third]);
    assert_eq!(rows[0].status, DeliveryStatus::Pending);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_claim_then_completion_deletes_row_and_processing_record(pool: PgPool) {
    // Arrange
    let store = PgOutboxStore::new(pool.clone());
    let t = now();
    let outbox_id = insert_outbox(&pool, "product.created", "k1").await;
    store
        .apply(&[claim(outbox_id, "search-index", "key-a", t)], &[])
        .await
        .unwrap();
    let claimed = store.find_processing("key-a").await.unwrap().unwrap();

    // Act
    let deleted = store
        .apply(
            &[OutboxWrite::Completed {
                outbox_id,
                idempotency_key: "key-a".to_string(),
                processed_at: t,
            }],
            &[check(outbox_id, &[("search-index", "key-a")])],
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(claimed.status, DeliveryStatus::Processing);
    assert_eq!(claimed.last_attempt_at, Some(t));
    assert_eq!(deleted, vec![outbox_id]);
    assert!(store.find_processing("key-a").await.unwrap().is_none());
    assert!(store.fetch_pending(10, t).await.unwrap().is_empty());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_claim_for_deleted_row_is_ignored(pool: PgPool) {
    let store = PgOutboxStore::new(pool);

    let result = store
        .apply(&[claim(4242, "search-index", "orphan", now())], &[])
        .await;

    assert!(result.is_ok());
    assert!(store.find_processing("orphan").await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_retry_keeps_earliest_due_time_on_row(pool: PgPool) {
    // Arrange
    let store = PgOutboxStore::new(pool.clone());
    let t = now();
    let outbox_id = insert_outbox(&pool, "product.created", "k1").await;
    let retry = |key: &str, count: i32, secs: i64| OutboxWrite::Retry {
        outbox_id,
        idempotency_key: key.to_string(),
        retry_count: count,
        next_retry_at: t + Duration::seconds(secs),
        attempted_at: t,
    };

    // Act
    store
        .apply(
            &[
                claim(outbox_id, "a", "key-a", t),
                claim(outbox_id, "b", "key-b", t),
                retry("key-a", 3, 8),
                retry("key-b", 1, 1),
            ],
            &[],
        )
        .await
        .unwrap();

    // Assert
    let rows = store.fetch_pending(10, t + Duration::seconds(1)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, DeliveryStatus::Failed);
    assert_eq!(rows[0].retry_count, 3);
    assert_eq!(rows[0].next_retry_at, Some(t + Duration::seconds(1)));
    let a = store.find_processing("key-a").await.unwrap().unwrap();
    assert_eq!(a.retry_count, 3);
    assert_eq!(a.next_retry_at, Some(t + Duration::seconds(8)));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_dead_letter_settles_its_handler(pool: PgPool) {
    // Arrange
    let store = PgOutboxStore::new(pool.clone());
    let t = now();
    let outbox_id = insert_outbox(&pool, "product.created", "k1").await;
    store
        .apply(
            &[
                claim(outbox_id, "search-index", "key-a", t),
                claim(outbox_id, "crm-sync", "key-b", t),
                OutboxWrite::Completed {
                    outbox_id,
                    idempotency_key: "key-a".to_string(),
                    processed_at: t,
                },
            ],
            &[],
        )
        .await
        .unwrap();
    let expected = check(outbox_id, &[("search-index", "key-a"), ("crm-sync", "key-b")]);
    let pending = store.apply(&[], &[expected.clone()]).await.unwrap();

    // Act
    store
        .insert_dead_letter(&dead_letter(outbox_id, "crm-sync"))
        .await
        .unwrap();
    let deleted = store
        .apply(
            &[OutboxWrite::Failed {
                outbox_id,
                idempotency_key: "key-b".to_string(),
            }],
            &[expected],
        )
        .await
        .unwrap();

    // Assert
    assert!(pending.is_empty());
    assert_eq!(deleted, vec![outbox_id]);
    let dead = store.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].handler_id, "crm-sync");
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_claim_for_dead_lettered_handler_is_ignored(pool: PgPool) {
    // Arrange
    let store = PgOutboxStore::new(pool.clone());
    let t = now();
    let outbox_id = insert_outbox(&pool, "product.created", "k1").await;
    store
        .insert_dead_letter(&dead_letter(outbox_id, "crm-sync"))
        .await
        .unwrap();

    // Act
    store
        .apply(&[claim(outbox_id, "crm-sync", "key-b", t)], &[])
        .await
        .unwrap();

    // Assert
    assert!(store.is_dead_lettered(outbox_id, "crm-sync").await.unwrap());
    assert!(!store.is_dead_lettered(outbox_id, "mailer").await.unwrap());
    assert!(store.find_processing("key-b").await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_rows_sharing_a_processing_record_settle_together(pool: PgPool) {
    // Arrange
    let store = PgOutboxStore::new(pool.clone());
    let t = now();
    let first = insert_outbox(&pool, "product.created", "k1").await;
    let second = insert_outbox(&pool, "product.created", "k2").await;

    // Act
    let deleted = store
        .apply(
            &[
                claim(first, "search-index", "shared", t),
                OutboxWrite::Completed {
                    outbox_id: first,
                    idempotency_key: "shared".to_string(),
                    processed_at: t,
                },
            ],
            &[
                check(first, &[("search-index", "shared")]),
                check(second, &[("search-index", "shared")]),
            ],
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(deleted.len(), 2);
    assert!(deleted.contains(&first));
    assert!(deleted.contains(&second));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
async fn test_dead_letters_are_listed_newest_first(pool: PgPool) {
    let store = PgOutboxStore::new(pool);
    store.insert_dead_letter(&dead_letter(1, "older")).await.unwrap();
    store.insert_dead_letter(&dead_letter(2, "newer")).await.unwrap();

    let dead = store.dead_letters(1).await.unwrap();

    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].handler_id, "newer");
}
