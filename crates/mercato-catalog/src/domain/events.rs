//! Domain events and aggregate state for the Catalog context.

use std::fmt;

use mercato_core::error::DomainError;
use mercato_core::event::{DomainEvent, EventMetadata, StateTransition};
use mercato_core::repository::StoredEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type for [`ProductEventKind::Created`].
pub const PRODUCT_CREATED_EVENT_TYPE: &str = "product.created";
/// Event type for [`ProductEventKind::DetailsUpdated`].
pub const PRODUCT_DETAILS_UPDATED_EVENT_TYPE: &str = "product.details_updated";
/// Event type for [`ProductEventKind::PriceChanged`].
pub const PRODUCT_PRICE_CHANGED_EVENT_TYPE: &str = "product.price_changed";
/// Event type for [`ProductEventKind::Published`].
pub const PRODUCT_PUBLISHED_EVENT_TYPE: &str = "product.published";
/// Event type for [`ProductEventKind::Archived`].
pub const PRODUCT_ARCHIVED_EVENT_TYPE: &str = "product.archived";

/// Event type for [`CollectionEventKind::Created`].
pub const COLLECTION_CREATED_EVENT_TYPE: &str = "collection.created";
/// Event type for [`CollectionEventKind::Renamed`].
pub const COLLECTION_RENAMED_EVENT_TYPE: &str = "collection.renamed";
/// Event type for [`CollectionEventKind::ProductAdded`].
pub const COLLECTION_PRODUCT_ADDED_EVENT_TYPE: &str = "collection.product_added";
/// Event type for [`CollectionEventKind::ProductRemoved`].
pub const COLLECTION_PRODUCT_REMOVED_EVENT_TYPE: &str = "collection.product_removed";
/// Event type for [`CollectionEventKind::Archived`].
pub const COLLECTION_ARCHIVED_EVENT_TYPE: &str = "collection.archived";

/// Every event type the Catalog context publishes.
pub const CATALOG_EVENT_TYPES: [&str; 10] = [
    PRODUCT_CREATED_EVENT_TYPE,
    PRODUCT_DETAILS_UPDATED_EVENT_TYPE,
    PRODUCT_PRICE_CHANGED_EVENT_TYPE,
    PRODUCT_PUBLISHED_EVENT_TYPE,
    PRODUCT_ARCHIVED_EVENT_TYPE,
    COLLECTION_CREATED_EVENT_TYPE,
    COLLECTION_RENAMED_EVENT_TYPE,
    COLLECTION_PRODUCT_ADDED_EVENT_TYPE,
    COLLECTION_PRODUCT_REMOVED_EVENT_TYPE,
    COLLECTION_ARCHIVED_EVENT_TYPE,
];

/// Lifecycle of a product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    /// Created but not visible to shoppers.
    #[default]
    Draft,
    /// Visible to shoppers.
    Published,
    /// Retired; no further changes.
    Archived,
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        })
    }
}

/// Title and description of a product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDetails {
    /// Display title.
    pub title: String,
    /// Long description; may be empty.
    pub description: String,
}

impl ProductDetails {
    /// Checks the details.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the title is blank.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.title.trim().is_empty() {
            return Err(DomainError::Validation(
                "product title must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A price in minor units of an ISO 4217 currency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    /// Amount in minor units (cents).
    pub amount_cents: i64,
    /// Three-letter currency code.
    pub currency: String,
}

impl Price {
    /// Checks the price.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the amount is negative or the
    /// currency is not three uppercase ASCII letters.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.amount_cents < 0 {
            return Err(DomainError::Validation(format!(
                "price must not be negative, got {}",
                self.amount_cents
            )));
        }
        if self.currency.len() != 3 || !self.currency.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(DomainError::Validation(format!(
                "invalid currency code: {:?}",
                self.currency
            )));
        }
        Ok(())
    }
}

/// Full business state of a product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductState {
    /// Title and description.
    pub details: ProductDetails,
    /// Current price.
    pub price: Price,
    /// Lifecycle status.
    pub status: ProductStatus,
}

/// Product event payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "transition", rename_all = "snake_case")]
pub enum ProductEventKind {
    /// The product was created as a draft.
    Created(StateTransition<ProductState>),
    /// Title or description changed.
    DetailsUpdated(StateTransition<ProductState>),
    /// The price changed.
    PriceChanged(StateTransition<ProductState>),
    /// The product became visible.
    Published(StateTransition<ProductState>),
    /// The product was retired.
    Archived(StateTransition<ProductState>),
}

impl ProductEventKind {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => PRODUCT_CREATED_EVENT_TYPE,
            Self::DetailsUpdated(_) => PRODUCT_DETAILS_UPDATED_EVENT_TYPE,
            Self::PriceChanged(_) => PRODUCT_PRICE_CHANGED_EVENT_TYPE,
            Self::Published(_) => PRODUCT_PUBLISHED_EVENT_TYPE,
            Self::Archived(_) => PRODUCT_ARCHIVED_EVENT_TYPE,
        }
    }

    fn transition(&self) -> &StateTransition<ProductState> {
        match self {
            Self::Created(t)
            | Self::DetailsUpdated(t)
            | Self::PriceChanged(t)
            | Self::Published(t)
            | Self::Archived(t) => t,
        }
    }
}

/// Domain event envelope for products.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: ProductEventKind,
}

/// Lifecycle of a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    /// Accepting changes.
    #[default]
    Active,
    /// Retired; no further changes.
    Archived,
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Archived => "archived",
        })
    }
}

/// Full business state of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionState {
    /// Display name.
    pub name: String,
    /// Member products, in the order they were added.
    pub product_ids: Vec<Uuid>,
    /// Lifecycle status.
    pub status: CollectionStatus,
}

/// Collection event payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "transition", rename_all = "snake_case")]
pub enum CollectionEventKind {
    /// The collection was created empty.
    Created(StateTransition<CollectionState>),
    /// The name changed.
    Renamed(StateTransition<CollectionState>),
    /// A product joined the collection.
    ProductAdded(StateTransition<CollectionState>),
    /// A product left the collection.
    ProductRemoved(StateTransition<CollectionState>),
    /// The collection was retired.
    Archived(StateTransition<CollectionState>),
}

impl CollectionEventKind {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => COLLECTION_CREATED_EVENT_TYPE,
            Self::Renamed(_) => COLLECTION_RENAMED_EVENT_TYPE,
            Self::ProductAdded(_) => COLLECTION_PRODUCT_ADDED_EVENT_TYPE,
            Self::ProductRemoved(_) => COLLECTION_PRODUCT_REMOVED_EVENT_TYPE,
            Self::Archived(_) => COLLECTION_ARCHIVED_EVENT_TYPE,
        }
    }

    fn transition(&self) -> &StateTransition<CollectionState> {
        match self {
            Self::Created(t)
            | Self::Renamed(t)
            | Self::ProductAdded(t)
            | Self::ProductRemoved(t)
            | Self::Archived(t) => t,
        }
    }
}

/// Domain event envelope for collections.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: CollectionEventKind,
}

/// Decodes a stored payload, rejecting rows whose `event_type` column does
/// not match the decoded variant.
fn decode_kind<K: serde::de::DeserializeOwned>(
    stored: &StoredEvent,
    event_type: impl Fn(&K) -> &'static str,
) -> Result<K, DomainError> {
    let kind: K = serde_json::from_value(stored.payload.clone()).map_err(|e| {
        DomainError::Infrastructure(format!(
            "event deserialization failed for {} v{}: {e}",
            stored.aggregate_id, stored.version
        ))
    })?;
    let decoded = event_type(&kind);
    if decoded != stored.event_type {
        return Err(DomainError::Infrastructure(format!(
            "event {} of {} is stored as {} but decodes as {decoded}",
            stored.version, stored.aggregate_id, stored.event_type
        )));
    }
    Ok(kind)
}

impl DomainEvent for ProductEvent {
    type State = ProductState;

    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn transition(&self) -> &StateTransition<ProductState> {
        self.kind.transition()
    }

    fn to_payload(&self) -> serde_json::Value {
        // Serialization of derived Serialize types to Value is infallible.
        serde_json::to_value(&self.kind).expect("ProductEventKind serialization is infallible")
    }

    fn from_stored(stored: &StoredEvent) -> Result<Self, DomainError> {
        Ok(Self {
            metadata: EventMetadata::from_stored(stored),
            kind: decode_kind(stored, ProductEventKind::event_type)?,
        })
    }
}

impl DomainEvent for CollectionEvent {
    type State = CollectionState;

    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn transition(&self) -> &StateTransition<CollectionState> {
        self.kind.transition()
    }

    fn to_payload(&self) -> serde_json::Value {
        // Serialization of derived Serialize types to Value is infallible.
        serde_json::to_value(&self.kind).expect("CollectionEventKind serialization is infallible")
    }

    fn from_stored(stored: &StoredEvent) -> Result<Self, DomainError> {
        Ok(Self {
            metadata: EventMetadata::from_stored(stored),
            kind: decode_kind(stored, CollectionEventKind::event_type)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_rejects_negative_amount_and_bad_currency() {
        let negative = Price {
            amount_cents: -1,
            currency: "USD".into(),
        };
        let lowercase = Price {
            amount_cents: 100,
            currency: "usd".into(),
        };

        assert!(matches!(negative.validate(), Err(DomainError::Validation(_))));
        assert!(matches!(lowercase.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_free_product_is_valid() {
        let price = Price {
            amount_cents: 0,
            currency: "EUR".into(),
        };

        assert!(price.validate().is_ok());
    }

    #[test]
    fn test_blank_title_is_rejected() {
        let details = ProductDetails {
            title: "   ".into(),
            description: "desc".into(),
        };

        assert!(matches!(details.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_payload_names_the_variant() {
        let kind = ProductEventKind::Published(StateTransition::new(
            ProductState::default(),
            ProductState {
                status: ProductStatus::Published,
                ..ProductState::default()
            },
        ));

        let payload = serde_json::to_value(&kind).unwrap();

        assert_eq!(payload["kind"], "published");
        assert_eq!(payload["transition"]["prior_state"]["status"], "draft");
        assert_eq!(payload["transition"]["new_state"]["status"], "published");
    }
}
