//! Command handlers for the Catalog context.
//!
//! Each handler runs inside one unit of work: load the aggregate from its
//! snapshot, check the caller's expected version, execute the command, then
//! queue the new events, one outbox row per event and the refreshed snapshot
//! onto the same write batch.

use mercato_core::aggregate::{AggregateRoot, EMPTY_VERSION, check_expected_version};
use mercato_core::clock::Clock;
use mercato_core::command::{Command, CommandMetadata};
use mercato_core::error::DomainError;
use mercato_core::event::DomainEvent;
use mercato_core::idempotency::outbox_idempotency_key;
use mercato_core::outbox::NewOutboxMessage;
use mercato_core::repository::{Repositories, StoredEvent, UnitOfWork};
use uuid::Uuid;

use crate::domain::aggregates::{Collection, Product};
use crate::domain::commands::{
    AddProductToCollection, ArchiveCollection, ArchiveProduct, ChangeProductPrice,
    CreateCollection, CreateProduct, PublishProduct, RemoveProductFromCollection,
    RenameCollection, UpdateProductDetails,
};
use crate::domain::events::ProductStatus;

/// Result of a successfully handled command.
#[derive(Debug)]
pub struct CatalogCommandResult {
    /// The aggregate ID affected by the command.
    pub aggregate_id: Uuid,
    /// The aggregate version after the command.
    pub version: i64,
    /// The stored events produced and persisted.
    pub stored_events: Vec<StoredEvent>,
}

/// Builds the integration message published for one domain event.
fn integration_message(event: &StoredEvent) -> NewOutboxMessage {
    NewOutboxMessage {
        aggregate_id: event.aggregate_id,
        event_type: event.event_type.clone(),
        payload: serde_json::json!({
            "event_id": event.event_id,
            "event_type": event.event_type,
            "aggregate_id": event.aggregate_id,
            "version": event.version,
            "correlation_id": event.correlation_id,
            "user_id": event.user_id,
            "occurred_at": event.occurred_at,
            "data": event.payload,
        }),
        idempotency_key: outbox_idempotency_key(
            event.aggregate_id,
            event.version,
            &event.event_type,
        ),
        occurred_at: event.occurred_at,
    }
}

/// Restores an aggregate from its snapshot after checking the expected
/// version.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if there is no snapshot and
/// `DomainError::ConcurrencyConflict` if the stored version differs.
async fn load_for_update<A: AggregateRoot>(
    repos: &Repositories,
    aggregate_id: Uuid,
    expected_version: i64,
) -> Result<A, DomainError> {
    let snapshot = repos
        .snapshots
        .get_snapshot(aggregate_id)
        .await?
        .ok_or(DomainError::AggregateNotFound(aggregate_id))?;
    check_expected_version(&snapshot, expected_version)?;
    A::load_from_snapshot(&snapshot)
}

/// Queues the aggregate's uncommitted events, their outbox rows and the new
/// snapshot onto the batch.
fn stage<A: AggregateRoot>(
    repos: &Repositories,
    aggregate: &mut A,
) -> Result<CatalogCommandResult, DomainError> {
    let stored_events: Vec<StoredEvent> = aggregate
        .uncommitted_events()
        .iter()
        .map(DomainEvent::to_stored)
        .collect();

    for event in &stored_events {
        repos.events.add_event(event.clone())?;
        repos.outbox.add_message(integration_message(event))?;
    }
    repos.snapshots.save_snapshot(aggregate.to_snapshot()?)?;
    aggregate.clear_uncommitted_events();

    Ok(CatalogCommandResult {
        aggregate_id: aggregate.aggregate_id(),
        version: aggregate.version(),
        stored_events,
    })
}

fn log_handled<C: Command>(command: &C, result: &CatalogCommandResult) {
    tracing::info!(
        command_type = command.command_type(),
        correlation_id = %command.correlation_id(),
        aggregate_id = %result.aggregate_id,
        version = result.version,
        events = result.stored_events.len(),
        "command handled"
    );
}

/// Creates a new aggregate. An existing snapshot for the id is a conflict.
async fn create<A, C, U, F>(
    uow: &U,
    command: &C,
    aggregate_id: Uuid,
    clock: &dyn Clock,
    build: F,
) -> Result<CatalogCommandResult, DomainError>
where
    A: AggregateRoot,
    C: Command,
    U: UnitOfWork,
    F: FnOnce(&CommandMetadata, &dyn Clock) -> Result<A, DomainError> + Send,
{
    let metadata = CommandMetadata::of(command);
    let result = uow
        .with_transaction(move |repos| async move {
            if let Some(existing) = repos.snapshots.get_snapshot(aggregate_id).await? {
                return Err(DomainError::ConcurrencyConflict {
                    aggregate_id,
                    expected: EMPTY_VERSION,
                    actual: existing.version,
                });
            }
            let mut aggregate = build(&metadata, clock)?;
            stage(&repos, &mut aggregate)
        })
        .await?;
    log_handled(command, &result);
    Ok(result)
}

/// Loads an existing aggregate at `expected_version` and runs `operation`.
async fn mutate<A, C, U, F>(
    uow: &U,
    command: &C,
    aggregate_id: Uuid,
    expected_version: i64,
    clock: &dyn Clock,
    operation: F,
) -> Result<CatalogCommandResult, DomainError>
where
    A: AggregateRoot,
    C: Command,
    U: UnitOfWork,
    F: FnOnce(&mut A, &CommandMetadata, &dyn Clock) -> Result<(), DomainError> + Send,
{
    let metadata = CommandMetadata::of(command);
    let result = uow
        .with_transaction(move |repos| async move {
            let mut aggregate: A = load_for_update(&repos, aggregate_id, expected_version).await?;
            operation(&mut aggregate, &metadata, clock)?;
            stage(&repos, &mut aggregate)
        })
        .await?;
    log_handled(command, &result);
    Ok(result)
}

/// Handles the `CreateProduct` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for invalid details or price,
/// `DomainError::ConcurrencyConflict` if the product already exists, and any
/// commit failure of the unit of work.
pub async fn handle_create_product<U: UnitOfWork>(
    command: &CreateProduct,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    let product_id = command.product_id;
    let details = command.details.clone();
    let price = command.price.clone();
    create(uow, command, product_id, clock, move |metadata, clock| {
        Product::create(product_id, details, price, metadata, clock)
    })
    .await
}

/// Handles the `UpdateProductDetails` command.
///
/// # Errors
///
/// Returns `DomainError` if the product is missing, the version is stale,
/// the product is archived or the details are invalid.
pub async fn handle_update_product_details<U: UnitOfWork>(
    command: &UpdateProductDetails,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    let details = command.details.clone();
    mutate(
        uow,
        command,
        command.product_id,
        command.expected_version,
        clock,
        move |product: &mut Product, metadata, clock| {
            product.update_details(details, metadata, clock)
        },
    )
    .await
}

/// Handles the `ChangeProductPrice` command.
///
/// # Errors
///
/// Returns `DomainError` if the product is missing, the version is stale,
/// the product is archived or the price is invalid.
pub async fn handle_change_product_price<U: UnitOfWork>(
    command: &ChangeProductPrice,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    let price = command.price.clone();
    mutate(
        uow,
        command,
        command.product_id,
        command.expected_version,
        clock,
        move |product: &mut Product, metadata, clock| product.change_price(price, metadata, clock),
    )
    .await
}

/// Handles the `PublishProduct` command.
///
/// # Errors
///
/// Returns `DomainError` if the product is missing, the version is stale or
/// the product is not a draft.
pub async fn handle_publish_product<U: UnitOfWork>(
    command: &PublishProduct,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    mutate(
        uow,
        command,
        command.product_id,
        command.expected_version,
        clock,
        |product: &mut Product, metadata, clock| product.publish(metadata, clock),
    )
    .await
}

/// Handles the `ArchiveProduct` command.
///
/// # Errors
///
/// Returns `DomainError` if the product is missing, the version is stale or
/// the product is already archived.
pub async fn handle_archive_product<U: UnitOfWork>(
    command: &ArchiveProduct,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    mutate(
        uow,
        command,
        command.product_id,
        command.expected_version,
        clock,
        |product: &mut Product, metadata, clock| product.archive(metadata, clock),
    )
    .await
}

/// Handles the `CreateCollection` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for a blank name,
/// `DomainError::ConcurrencyConflict` if the collection already exists, and
/// any commit failure of the unit of work.
pub async fn handle_create_collection<U: UnitOfWork>(
    command: &CreateCollection,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    let collection_id = command.collection_id;
    let name = command.name.clone();
    create(uow, command, collection_id, clock, move |metadata, clock| {
        Collection::create(collection_id, name, metadata, clock)
    })
    .await
}

/// Handles the `RenameCollection` command.
///
/// # Errors
///
/// Returns `DomainError` if the collection is missing, the version is stale,
/// the collection is archived or the name is blank.
pub async fn handle_rename_collection<U: UnitOfWork>(
    command: &RenameCollection,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    let name = command.name.clone();
    mutate(
        uow,
        command,
        command.collection_id,
        command.expected_version,
        clock,
        move |collection: &mut Collection, metadata, clock| {
            collection.rename(name, metadata, clock)
        },
    )
    .await
}

/// Handles the `AddProductToCollection` command.
///
/// The product must exist and must not be archived.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the collection or the product
/// is missing, `DomainError::Validation` if the product is archived or
/// already a member, and the usual version and state errors.
pub async fn handle_add_product_to_collection<U: UnitOfWork>(
    command: &AddProductToCollection,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    let collection_id = command.collection_id;
    let expected_version = command.expected_version;
    let product_id = command.product_id;
    let metadata = CommandMetadata::of(command);

    let result = uow
        .with_transaction(move |repos| async move {
            let mut collection: Collection =
                load_for_update(&repos, collection_id, expected_version).await?;

            let product_snapshot = repos
                .snapshots
                .get_snapshot(product_id)
                .await?
                .ok_or(DomainError::AggregateNotFound(product_id))?;
            let product = Product::load_from_snapshot(&product_snapshot)?;
            if product.status() == ProductStatus::Archived {
                return Err(DomainError::Validation(format!(
                    "product {product_id} is archived and cannot join a collection"
                )));
            }

            collection.add_product(product_id, &metadata, clock)?;
            stage(&repos, &mut collection)
        })
        .await?;
    log_handled(command, &result);
    Ok(result)
}

/// Handles the `RemoveProductFromCollection` command.
///
/// # Errors
///
/// Returns `DomainError` if the collection is missing, the version is stale,
/// the collection is archived or the product is not a member.
pub async fn handle_remove_product_from_collection<U: UnitOfWork>(
    command: &RemoveProductFromCollection,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    let product_id = command.product_id;
    mutate(
        uow,
        command,
        command.collection_id,
        command.expected_version,
        clock,
        move |collection: &mut Collection, metadata, clock| {
            collection.remove_product(product_id, metadata, clock)
        },
    )
    .await
}

/// Handles the `ArchiveCollection` command.
///
/// # Errors
///
/// Returns `DomainError` if the collection is missing, the version is stale
/// or the collection is already archived.
pub async fn handle_archive_collection<U: UnitOfWork>(
    command: &ArchiveCollection,
    clock: &dyn Clock,
    uow: &U,
) -> Result<CatalogCommandResult, DomainError> {
    mutate(
        uow,
        command,
        command.collection_id,
        command.expected_version,
        clock,
        |collection: &mut Collection, metadata, clock| collection.archive(metadata, clock),
    )
    .await
}
