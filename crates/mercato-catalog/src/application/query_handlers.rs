//! Query handlers for the Catalog context.
//!
//! Current-state queries read the snapshot; history queries replay the full
//! event log from the empty state.

use chrono::{DateTime, Utc};
use mercato_core::aggregate::{AggregateRoot, rehydrate};
use mercato_core::error::DomainError;
use mercato_core::repository::StoreReader;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::{Collection, Product};
use crate::domain::events::{CollectionStatus, ProductStatus};

/// Read-only view of a product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductView {
    /// The product identifier.
    pub product_id: Uuid,
    /// Display title.
    pub title: String,
    /// Long description.
    pub description: String,
    /// Price in minor units.
    pub amount_cents: i64,
    /// Currency code.
    pub currency: String,
    /// Lifecycle status.
    pub status: ProductStatus,
    /// Version of the last applied event.
    pub version: i64,
}

impl ProductView {
    fn of(product: &Product) -> Self {
        let state = product.state();
        Self {
            product_id: product.aggregate_id(),
            title: state.details.title.clone(),
            description: state.details.description.clone(),
            amount_cents: state.price.amount_cents,
            currency: state.price.currency.clone(),
            status: state.status,
            version: product.version(),
        }
    }
}

/// One entry of a product's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// Version produced by the event.
    pub version: i64,
    /// Event type name.
    pub event_type: String,
    /// Who issued the command.
    pub user_id: String,
    /// Request the event belongs to.
    pub correlation_id: Uuid,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// A product rebuilt from its event log, with the log itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductHistoryView {
    /// State reconstructed by replay.
    pub product: ProductView,
    /// Every event in version order.
    pub entries: Vec<HistoryEntry>,
}

/// Read-only view of a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionView {
    /// The collection identifier.
    pub collection_id: Uuid,
    /// Display name.
    pub name: String,
    /// Member products in insertion order.
    pub product_ids: Vec<Uuid>,
    /// Lifecycle status.
    pub status: CollectionStatus,
    /// Version of the last applied event.
    pub version: i64,
}

/// Retrieves the current state of a product from its snapshot.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the product has no snapshot
/// and `DomainError::Infrastructure` if the snapshot does not decode.
pub async fn get_product(
    product_id: Uuid,
    reader: &dyn StoreReader,
) -> Result<ProductView, DomainError> {
    let snapshot = reader
        .get_snapshot(product_id)
        .await?
        .ok_or(DomainError::AggregateNotFound(product_id))?;
    let product = Product::load_from_snapshot(&snapshot)?;
    Ok(ProductView::of(&product))
}

/// Rebuilds a product from its full event history.
///
/// Independent of the snapshot, so it also serves as a consistency check.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if no events exist and
/// `DomainError::Infrastructure` if the history is broken or undecodable.
pub async fn get_product_history(
    product_id: Uuid,
    reader: &dyn StoreReader,
) -> Result<ProductHistoryView, DomainError> {
    let events = reader.load_events(product_id).await?;
    let product: Product = rehydrate(product_id, &events)?;
    let entries = events
        .into_iter()
        .map(|event| HistoryEntry {
            version: event.version,
            event_type: event.event_type,
            user_id: event.user_id,
            correlation_id: event.correlation_id,
            occurred_at: event.occurred_at,
        })
        .collect();
    Ok(ProductHistoryView {
        product: ProductView::of(&product),
        entries,
    })
}

/// Retrieves the current state of a collection from its snapshot.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the collection has no
/// snapshot and `DomainError::Infrastructure` if the snapshot does not decode.
pub async fn get_collection(
    collection_id: Uuid,
    reader: &dyn StoreReader,
) -> Result<CollectionView, DomainError> {
    let snapshot = reader
        .get_snapshot(collection_id)
        .await?
        .ok_or(DomainError::AggregateNotFound(collection_id))?;
    let collection = Collection::load_from_snapshot(&snapshot)?;
    let state = collection.state();
    Ok(CollectionView {
        collection_id,
        name: state.name.clone(),
        product_ids: state.product_ids.clone(),
        status: state.status,
        version: collection.version(),
    })
}
