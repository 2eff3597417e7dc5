//! End-to-end tests of the catalog write path over the in-memory store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mercato_catalog::application::command_handlers::{
    handle_add_product_to_collection, handle_archive_product, handle_change_product_price,
    handle_create_collection, handle_create_product, handle_publish_product,
};
use mercato_catalog::application::query_handlers::{
    get_collection, get_product, get_product_history,
};
use mercato_catalog::domain::commands::{
    AddProductToCollection, ArchiveProduct, ChangeProductPrice, CreateCollection, CreateProduct,
    PublishProduct,
};
use mercato_catalog::domain::events::{
    PRODUCT_CREATED_EVENT_TYPE, PRODUCT_PUBLISHED_EVENT_TYPE, Price, ProductDetails,
    ProductStatus,
};
use mercato_core::error::{DomainError, HandlerError};
use mercato_core::outbox::DeliveryStatus;
use mercato_event_store::batcher::{Batcher, BatcherConfig};
use mercato_event_store::unit_of_work::BatchingUnitOfWork;
use mercato_outbox::config::PollerConfig;
use mercato_outbox::poller::OutboxPoller;
use mercato_outbox::registry::{HandlerRegistry, IntegrationEventHandler};
use mercato_test_support::{InMemoryStore, ManualClock};
use uuid::Uuid;

struct Catalog {
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
    batcher: Batcher,
    uow: BatchingUnitOfWork,
}

impl Catalog {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let batcher = Batcher::spawn(store.clone(), BatcherConfig::default());
        let uow = BatchingUnitOfWork::new(store.clone(), batcher.handle());
        Self {
            store,
            clock: Arc::new(ManualClock::at_epoch()),
            batcher,
            uow,
        }
    }

    async fn create_product(&self, product_id: Uuid) {
        handle_create_product(&create_product(product_id), self.clock.as_ref(), &self.uow)
            .await
            .unwrap();
    }
}

fn create_product(product_id: Uuid) -> CreateProduct {
    CreateProduct {
        correlation_id: Uuid::new_v4(),
        user_id: "merchandiser-1".to_owned(),
        product_id,
        details: ProductDetails {
            title: "Desk lamp".to_owned(),
            description: "Brass, adjustable".to_owned(),
        },
        price: Price {
            amount_cents: 4_999,
            currency: "USD".to_owned(),
        },
    }
}

fn publish(product_id: Uuid, expected_version: i64) -> PublishProduct {
    PublishProduct {
        correlation_id: Uuid::new_v4(),
        user_id: "merchandiser-2".to_owned(),
        product_id,
        expected_version,
    }
}

fn change_price(product_id: Uuid, expected_version: i64, amount_cents: i64) -> ChangeProductPrice {
    ChangeProductPrice {
        correlation_id: Uuid::new_v4(),
        user_id: "merchandiser-1".to_owned(),
        product_id,
        expected_version,
        price: Price {
            amount_cents,
            currency: "USD".to_owned(),
        },
    }
}

#[tokio::test]
async fn test_create_product_writes_event_snapshot_and_outbox_atomically() {
    // Arrange
    let catalog = Catalog::new();
    let product_id = Uuid::new_v4();

    // Act
    catalog.create_product(product_id).await;

    // Assert
    let events = catalog.store.events(product_id);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].version, 0);
    assert_eq!(catalog.store.snapshot(product_id).unwrap().version, 0);
    let outbox = catalog.store.outbox_rows();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].status, DeliveryStatus::Pending);
    assert_eq!(outbox[0].event_type, PRODUCT_CREATED_EVENT_TYPE);
    assert_eq!(outbox[0].aggregate_id, product_id);
    assert_eq!(catalog.store.commit_count(), 1);
    catalog.batcher.shutdown().await;
}

#[tokio::test]
async fn test_stale_expected_version_is_rejected_without_writes() {
    // Arrange
    let catalog = Catalog::new();
    let product_id = Uuid::new_v4();
    catalog.create_product(product_id).await;
    handle_publish_product(&publish(product_id, 0), catalog.clock.as_ref(), &catalog.uow)
        .await
        .unwrap();
    let commits_before = catalog.store.commit_count();

    // Act
    let result = handle_change_product_price(
        &change_price(product_id, 0, 1_999),
        catalog.clock.as_ref(),
        &catalog.uow,
    )
    .await;

    // Assert
    match result {
        Err(DomainError::ConcurrencyConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }
    assert_eq!(catalog.store.commit_count(), commits_before);
    assert_eq!(catalog.store.events(product_id).len(), 2);
    assert_eq!(catalog.store.outbox_rows().len(), 2);
    catalog.batcher.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_commands_at_same_version_admit_exactly_one() {
    // Arrange
    let catalog = Catalog::new();
    let product_id = Uuid::new_v4();
    catalog.create_product(product_id).await;
    let first = change_price(product_id, 0, 3_999);
    let second = change_price(product_id, 0, 2_999);

    // Act
    let (a, b) = tokio::join!(
        handle_change_product_price(&first, catalog.clock.as_ref(), &catalog.uow),
        handle_change_product_price(&second, catalog.clock.as_ref(), &catalog.uow),
    );

    // Assert
    let outcomes = [a, b];
    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicted = outcomes
        .iter()
        .filter(|r| matches!(r, Err(DomainError::ConcurrencyConflict { .. })))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(conflicted, 1);
    assert!(
        outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(DomainError::is_transient)
    );
    assert_eq!(catalog.store.events(product_id).len(), 2);
    assert_eq!(catalog.store.snapshot(product_id).unwrap().version, 1);
    assert_eq!(catalog.store.outbox_rows().len(), 2);
    catalog.batcher.shutdown().await;
}

#[tokio::test]
async fn test_replayed_history_matches_snapshot() {
    // Arrange
    let catalog = Catalog::new();
    let product_id = Uuid::new_v4();
    catalog.create_product(product_id).await;
    handle_change_product_price(
        &change_price(product_id, 0, 2_500),
        catalog.clock.as_ref(),
        &catalog.uow,
    )
    .await
    .unwrap();
    handle_publish_product(&publish(product_id, 1), catalog.clock.as_ref(), &catalog.uow)
        .await
        .unwrap();

    // Act
    let current = get_product(product_id, catalog.store.as_ref()).await.unwrap();
    let history = get_product_history(product_id, catalog.store.as_ref())
        .await
        .unwrap();

    // Assert
    assert_eq!(history.product, current);
    assert_eq!(current.version, 2);
    assert_eq!(current.status, ProductStatus::Published);
    assert_eq!(current.amount_cents, 2_500);
    assert_eq!(history.entries.len(), 3);
    assert_eq!(history.entries[2].event_type, PRODUCT_PUBLISHED_EVENT_TYPE);
    assert_eq!(history.entries[2].user_id, "merchandiser-2");
    catalog.batcher.shutdown().await;
}

#[tokio::test]
async fn test_commit_failure_leaves_no_trace() {
    let catalog = Catalog::new();
    let product_id = Uuid::new_v4();
    catalog.store.fail_next_commit();

    let result =
        handle_create_product(&create_product(product_id), catalog.clock.as_ref(), &catalog.uow)
            .await;

    assert!(matches!(result, Err(DomainError::PhysicalCommitFailure(_))));
    assert!(result.is_err_and(|e| e.is_transient()));
    assert!(catalog.store.events(product_id).is_empty());
    assert!(catalog.store.snapshot(product_id).is_none());
    assert!(catalog.store.outbox_rows().is_empty());
    catalog.batcher.shutdown().await;
}

#[tokio::test]
async fn test_archived_product_cannot_join_collection() {
    // Arrange
    let catalog = Catalog::new();
    let product_id = Uuid::new_v4();
    let collection_id = Uuid::new_v4();
    catalog.create_product(product_id).await;
    handle_archive_product(
        &ArchiveProduct {
            correlation_id: Uuid::new_v4(),
            user_id: "merchandiser-1".to_owned(),
            product_id,
            expected_version: 0,
        },
        catalog.clock.as_ref(),
        &catalog.uow,
    )
    .await
    .unwrap();
    handle_create_collection(
        &CreateCollection {
            correlation_id: Uuid::new_v4(),
            user_id: "merchandiser-1".to_owned(),
            collection_id,
            name: "Lighting".to_owned(),
        },
        catalog.clock.as_ref(),
        &catalog.uow,
    )
    .await
    .unwrap();

    // Act
    let result = handle_add_product_to_collection(
        &AddProductToCollection {
            correlation_id: Uuid::new_v4(),
            user_id: "merchandiser-1".to_owned(),
            collection_id,
            expected_version: 0,
            product_id,
        },
        catalog.clock.as_ref(),
        &catalog.uow,
    )
    .await;

    // Assert
    assert!(matches!(result, Err(DomainError::Validation(_))));
    assert!(result.is_err_and(|e| !e.is_transient()));
    let collection = get_collection(collection_id, catalog.store.as_ref())
        .await
        .unwrap();
    assert_eq!(collection.version, 0);
    assert!(collection.product_ids.is_empty());
    catalog.batcher.shutdown().await;
}

#[tokio::test]
async fn test_unknown_product_cannot_join_collection() {
    let catalog = Catalog::new();
    let collection_id = Uuid::new_v4();
    let product_id = Uuid::new_v4();
    handle_create_collection(
        &CreateCollection {
            correlation_id: Uuid::new_v4(),
            user_id: "merchandiser-1".to_owned(),
            collection_id,
            name: "Lighting".to_owned(),
        },
        catalog.clock.as_ref(),
        &catalog.uow,
    )
    .await
    .unwrap();

    let result = handle_add_product_to_collection(
        &AddProductToCollection {
            correlation_id: Uuid::new_v4(),
            user_id: "merchandiser-1".to_owned(),
            collection_id,
            expected_version: 0,
            product_id,
        },
        catalog.clock.as_ref(),
        &catalog.uow,
    )
    .await;

    assert!(matches!(result, Err(DomainError::AggregateNotFound(id)) if id == product_id));
    catalog.batcher.shutdown().await;
}

#[derive(Default)]
struct SearchIndex {
    received: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl IntegrationEventHandler for SearchIndex {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), HandlerError> {
        self.received.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_outbox_delivers_catalog_events_to_handlers() {
    // Arrange
    let catalog = Catalog::new();
    let product_id = Uuid::new_v4();
    catalog.create_product(product_id).await;
    let index = Arc::new(SearchIndex::default());
    let mut registry = HandlerRegistry::new();
    registry
        .register(PRODUCT_CREATED_EVENT_TYPE, "search-index", index.clone())
        .unwrap();
    let poller = OutboxPoller::new(
        catalog.store.clone(),
        Arc::new(registry),
        catalog.clock.clone(),
        PollerConfig::default(),
    );

    // Act
    let report = poller.poll_once().await.unwrap();
    let flushed = poller.flush().await.unwrap();

    // Assert
    assert_eq!(report.completed, 1);
    assert!(flushed > 0);
    let received = index.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["aggregate_id"], product_id.to_string());
    assert_eq!(received[0]["version"], 0);
    assert_eq!(received[0]["data"]["kind"], "created");
    assert_eq!(
        received[0]["data"]["transition"]["new_state"]["details"]["title"],
        "Desk lamp"
    );
    assert!(catalog.store.outbox_rows().is_empty());
    catalog.batcher.shutdown().await;
}
