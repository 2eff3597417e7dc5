//! Commands for the Catalog context.
//!
//! Every command after the creating one carries the aggregate version the
//! caller last observed; a mismatch is rejected as a concurrency conflict.

use mercato_core::command::Command;
use uuid::Uuid;

use super::events::{Price, ProductDetails};

macro_rules! impl_command {
    ($ty:ty, $name:literal) => {
        impl Command for $ty {
            fn command_type(&self) -> &'static str {
                $name
            }

            fn correlation_id(&self) -> Uuid {
                self.correlation_id
            }

            fn user_id(&self) -> &str {
                &self.user_id
            }
        }
    };
}

/// Command to create a draft product.
#[derive(Debug, Clone)]
pub struct CreateProduct {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// Identifier of the new product.
    pub product_id: Uuid,
    /// Title and description.
    pub details: ProductDetails,
    /// Initial price.
    pub price: Price,
}

/// Command to replace a product's title and description.
#[derive(Debug, Clone)]
pub struct UpdateProductDetails {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// The product identifier.
    pub product_id: Uuid,
    /// Version the caller last observed.
    pub expected_version: i64,
    /// New title and description.
    pub details: ProductDetails,
}

/// Command to change a product's price.
#[derive(Debug, Clone)]
pub struct ChangeProductPrice {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// The product identifier.
    pub product_id: Uuid,
    /// Version the caller last observed.
    pub expected_version: i64,
    /// New price.
    pub price: Price,
}

/// Command to publish a draft product.
#[derive(Debug, Clone)]
pub struct PublishProduct {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// The product identifier.
    pub product_id: Uuid,
    /// Version the caller last observed.
    pub expected_version: i64,
}

/// Command to archive a product.
#[derive(Debug, Clone)]
pub struct ArchiveProduct {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// The product identifier.
    pub product_id: Uuid,
    /// Version the caller last observed.
    pub expected_version: i64,
}

/// Command to create an empty collection.
#[derive(Debug, Clone)]
pub struct CreateCollection {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// Identifier of the new collection.
    pub collection_id: Uuid,
    /// Display name.
    pub name: String,
}

/// Command to rename a collection.
#[derive(Debug, Clone)]
pub struct RenameCollection {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// The collection identifier.
    pub collection_id: Uuid,
    /// Version the caller last observed.
    pub expected_version: i64,
    /// New display name.
    pub name: String,
}

/// Command to add a product to a collection.
#[derive(Debug, Clone)]
pub struct AddProductToCollection {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// The collection identifier.
    pub collection_id: Uuid,
    /// Version the caller last observed.
    pub expected_version: i64,
    /// The product to add.
    pub product_id: Uuid,
}

/// Command to remove a product from a collection.
#[derive(Debug, Clone)]
pub struct RemoveProductFromCollection {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// The collection identifier.
    pub collection_id: Uuid,
    /// Version the caller last observed.
    pub expected_version: i64,
    /// The product to remove.
    pub product_id: Uuid,
}

/// Command to archive a collection.
#[derive(Debug, Clone)]
pub struct ArchiveCollection {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The actor issuing the command.
    pub user_id: String,
    /// The collection identifier.
    pub collection_id: Uuid,
    /// Version the caller last observed.
    pub expected_version: i64,
}

impl_command!(CreateProduct, "catalog.create_product");
impl_command!(UpdateProductDetails, "catalog.update_product_details");
impl_command!(ChangeProductPrice, "catalog.change_product_price");
impl_command!(PublishProduct, "catalog.publish_product");
impl_command!(ArchiveProduct, "catalog.archive_product");
impl_command!(CreateCollection, "catalog.create_collection");
impl_command!(RenameCollection, "catalog.rename_collection");
impl_command!(AddProductToCollection, "catalog.add_product_to_collection");
impl_command!(
    RemoveProductFromCollection,
    "catalog.remove_product_from_collection"
);
impl_command!(ArchiveCollection, "catalog.archive_collection");
