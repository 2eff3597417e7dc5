//! Aggregate roots for the Catalog context.

use mercato_core::aggregate::{AggregateKernel, AggregateRoot};
use mercato_core::clock::Clock;
use mercato_core::command::CommandMetadata;
use mercato_core::error::DomainError;
use uuid::Uuid;

use super::events::{
    COLLECTION_ARCHIVED_EVENT_TYPE, COLLECTION_CREATED_EVENT_TYPE,
    COLLECTION_PRODUCT_ADDED_EVENT_TYPE, COLLECTION_PRODUCT_REMOVED_EVENT_TYPE,
    COLLECTION_RENAMED_EVENT_TYPE, CollectionEvent, CollectionEventKind, CollectionState,
    CollectionStatus, PRODUCT_ARCHIVED_EVENT_TYPE, PRODUCT_CREATED_EVENT_TYPE,
    PRODUCT_DETAILS_UPDATED_EVENT_TYPE, PRODUCT_PRICE_CHANGED_EVENT_TYPE,
    PRODUCT_PUBLISHED_EVENT_TYPE, Price, ProductDetails, ProductEvent, ProductEventKind,
    ProductState, ProductStatus,
};

/// The aggregate root for a sellable product.
#[derive(Debug)]
pub struct Product {
    kernel: AggregateKernel<ProductState, ProductEvent>,
}

impl Product {
    /// Creates a draft product, recording `ProductCreated` at version 0.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the details or price are invalid.
    pub fn create(
        id: Uuid,
        details: ProductDetails,
        price: Price,
        command: &CommandMetadata,
        clock: &dyn Clock,
    ) -> Result<Self, DomainError> {
        details.validate()?;
        price.validate()?;

        let mut product = Self {
            kernel: AggregateKernel::empty(id),
        };
        product.kernel.record(
            PRODUCT_CREATED_EVENT_TYPE,
            command,
            clock,
            |state| {
                state.details = details;
                state.price = price;
                state.status = ProductStatus::Draft;
            },
            |metadata, t| ProductEvent {
                metadata,
                kind: ProductEventKind::Created(t),
            },
        );
        Ok(product)
    }

    /// Replaces the title and description.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidStateTransition` if the product is
    /// archived and `DomainError::Validation` if the details are invalid.
    pub fn update_details(
        &mut self,
        details: ProductDetails,
        command: &CommandMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_not_archived("update details")?;
        details.validate()?;

        self.kernel.record(
            PRODUCT_DETAILS_UPDATED_EVENT_TYPE,
            command,
            clock,
            |state| state.details = details,
            |metadata, t| ProductEvent {
                metadata,
                kind: ProductEventKind::DetailsUpdated(t),
            },
        );
        Ok(())
    }

    /// Sets a new price.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidStateTransition` if the product is
    /// archived and `DomainError::Validation` if the price is invalid.
    pub fn change_price(
        &mut self,
        price: Price,
        command: &CommandMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_not_archived("change price")?;
        price.validate()?;

        self.kernel.record(
            PRODUCT_PRICE_CHANGED_EVENT_TYPE,
            command,
            clock,
            |state| state.price = price,
            |metadata, t| ProductEvent {
                metadata,
                kind: ProductEventKind::PriceChanged(t),
            },
        );
        Ok(())
    }

    /// Makes a draft product visible.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidStateTransition` unless the product is a
    /// draft.
    pub fn publish(&mut self, command: &CommandMetadata, clock: &dyn Clock) -> Result<(), DomainError> {
        if self.status() != ProductStatus::Draft {
            return Err(self.invalid_transition("publish"));
        }

        self.kernel.record(
            PRODUCT_PUBLISHED_EVENT_TYPE,
            command,
            clock,
            |state| state.status = ProductStatus::Published,
            |metadata, t| ProductEvent {
                metadata,
                kind: ProductEventKind::Published(t),
            },
        );
        Ok(())
    }

    /// Retires the product.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidStateTransition` if it is already archived.
    pub fn archive(&mut self, command: &CommandMetadata, clock: &dyn Clock) -> Result<(), DomainError> {
        self.ensure_not_archived("archive")?;

        self.kernel.record(
            PRODUCT_ARCHIVED_EVENT_TYPE,
            command,
            clock,
            |state| state.status = ProductStatus::Archived,
            |metadata, t| ProductEvent {
                metadata,
                kind: ProductEventKind::Archived(t),
            },
        );
        Ok(())
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> ProductStatus {
        self.kernel.state().status
    }

    fn ensure_not_archived(&self, operation: &'static str) -> Result<(), DomainError> {
        if self.status() == ProductStatus::Archived {
            return Err(self.invalid_transition(operation));
        }
        Ok(())
    }

    fn invalid_transition(&self, operation: &'static str) -> DomainError {
        DomainError::InvalidStateTransition {
            aggregate_id: self.kernel.id(),
            from: self.status().to_string(),
            operation,
        }
    }
}

impl AggregateRoot for Product {
    const AGGREGATE_TYPE: &'static str = "product";
    type State = ProductState;
    type Event = ProductEvent;

    fn from_parts(id: Uuid, correlation_id: Uuid, version: i64, state: ProductState) -> Self {
        Self {
            kernel: AggregateKernel::from_parts(id, correlation_id, version, state),
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.kernel.id()
    }

    fn version(&self) -> i64 {
        self.kernel.version()
    }

    fn correlation_id(&self) -> Uuid {
        self.kernel.correlation_id()
    }

    fn state(&self) -> &ProductState {
        self.kernel.state()
    }

    fn apply(&mut self, event: &ProductEvent) {
        match &event.kind {
            ProductEventKind::Created(t)
            | ProductEventKind::DetailsUpdated(t)
            | ProductEventKind::PriceChanged(t)
            | ProductEventKind::Published(t)
            | ProductEventKind::Archived(t) => {
                self.kernel.apply_transition(&event.metadata, t);
            }
        }
    }

    fn uncommitted_events(&self) -> &[ProductEvent] {
        self.kernel.uncommitted_events()
    }

    fn clear_uncommitted_events(&mut self) {
        self.kernel.clear_uncommitted_events();
    }
}

/// The aggregate root for a curated group of products.
#[derive(Debug)]
pub struct Collection {
    kernel: AggregateKernel<CollectionState, CollectionEvent>,
}

fn validate_name(name: &str) -> Result<(), DomainError> {
    if name.trim().is_empty() {
        return Err(DomainError::Validation(
            "collection name must not be empty".to_owned(),
        ));
    }
    Ok(())
}

impl Collection {
    /// Creates an empty, active collection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the name is blank.
    pub fn create(
        id: Uuid,
        name: String,
        command: &CommandMetadata,
        clock: &dyn Clock,
    ) -> Result<Self, DomainError> {
        validate_name(&name)?;

        let mut collection = Self {
            kernel: AggregateKernel::empty(id),
        };
        collection.kernel.record(
            COLLECTION_CREATED_EVENT_TYPE,
            command,
            clock,
            |state| {
                state.name = name;
                state.status = CollectionStatus::Active;
            },
            |metadata, t| CollectionEvent {
                metadata,
                kind: CollectionEventKind::Created(t),
            },
        );
        Ok(collection)
    }

    /// Renames the collection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidStateTransition` if archived and
    /// `DomainError::Validation` if the name is blank.
    pub fn rename(
        &mut self,
        name: String,
        command: &CommandMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_active("rename")?;
        validate_name(&name)?;

        self.kernel.record(
            COLLECTION_RENAMED_EVENT_TYPE,
            command,
            clock,
            |state| state.name = name,
            |metadata, t| CollectionEvent {
                metadata,
                kind: CollectionEventKind::Renamed(t),
            },
        );
        Ok(())
    }

    /// Appends a product to the collection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidStateTransition` if archived and
    /// `DomainError::Validation` if the product is already a member.
    pub fn add_product(
        &mut self,
        product_id: Uuid,
        command: &CommandMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_active("add product")?;
        if self.contains(product_id) {
            return Err(DomainError::Validation(format!(
                "product {product_id} is already in collection {}",
                self.kernel.id()
            )));
        }

        self.kernel.record(
            COLLECTION_PRODUCT_ADDED_EVENT_TYPE,
            command,
            clock,
            |state| state.product_ids.push(product_id),
            |metadata, t| CollectionEvent {
                metadata,
                kind: CollectionEventKind::ProductAdded(t),
            },
        );
        Ok(())
    }

    /// Removes a product from the collection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidStateTransition` if archived and
    /// `DomainError::Validation` if the product is not a member.
    pub fn remove_product(
        &mut self,
        product_id: Uuid,
        command: &CommandMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_active("remove product")?;
        if !self.contains(product_id) {
            return Err(DomainError::Validation(format!(
                "product {product_id} not found in collection {}",
                self.kernel.id()
            )));
        }

        self.kernel.record(
            COLLECTION_PRODUCT_REMOVED_EVENT_TYPE,
            command,
            clock,
            |state| state.product_ids.retain(|id| *id != product_id),
            |metadata, t| CollectionEvent {
                metadata,
                kind: CollectionEventKind::ProductRemoved(t),
            },
        );
        Ok(())
    }

    /// Retires the collection.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidStateTransition` if already archived.
    pub fn archive(&mut self, command: &CommandMetadata, clock: &dyn Clock) -> Result<(), DomainError> {
        self.ensure_active("archive")?;

        self.kernel.record(
            COLLECTION_ARCHIVED_EVENT_TYPE,
            command,
            clock,
            |state| state.status = CollectionStatus::Archived,
            |metadata, t| CollectionEvent {
                metadata,
                kind: CollectionEventKind::Archived(t),
            },
        );
        Ok(())
    }

    /// Returns `true` if `product_id` is a member.
    #[must_use]
    pub fn contains(&self, product_id: Uuid) -> bool {
        self.kernel.state().product_ids.contains(&product_id)
    }

    fn ensure_active(&self, operation: &'static str) -> Result<(), DomainError> {
        let status = self.kernel.state().status;
        if status == CollectionStatus::Archived {
            return Err(DomainError::InvalidStateTransition {
                aggregate_id: self.kernel.id(),
                from: status.to_string(),
                operation,
            });
        }
        Ok(())
    }
}

impl AggregateRoot for Collection {
    const AGGREGATE_TYPE: &'static str = "collection";
    type State = CollectionState;
    type Event = CollectionEvent;

    fn from_parts(id: Uuid, correlation_id: Uuid, version: i64, state: CollectionState) -> Self {
        Self {
            kernel: AggregateKernel::from_parts(id, correlation_id, version, state),
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.kernel.id()
    }

    fn version(&self) -> i64 {
        self.kernel.version()
    }

    fn correlation_id(&self) -> Uuid {
        self.kernel.correlation_id()
    }

    fn state(&self) -> &CollectionState {
        self.kernel.state()
    }

    fn apply(&mut self, event: &CollectionEvent) {
        match &event.kind {
            CollectionEventKind::Created(t)
            | CollectionEventKind::Renamed(t)
            | CollectionEventKind::ProductAdded(t)
            | CollectionEventKind::ProductRemoved(t)
            | CollectionEventKind::Archived(t) => {
                self.kernel.apply_transition(&event.metadata, t);
            }
        }
    }

    fn uncommitted_events(&self) -> &[CollectionEvent] {
        self.kernel.uncommitted_events()
    }

    fn clear_uncommitted_events(&mut self) {
        self.kernel.clear_uncommitted_events();
    }
}
