//! The storage contract for persisted inventories.

use async_trait::async_trait;
use snafu::Snafu;

use crate::inventory::{Inventory, InventoryRef};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// The optimistic concurrency token was stale; the caller should
    /// reload, re-merge and retry.
    #[snafu(display("inventory {name:?} was modified concurrently"))]
    Conflict { name: String },

    #[snafu(display(
        "inventory object {name:?} is owned by inventory {actual:?}, expected {expected:?}"
    ))]
    WrongOwner {
        name: String,
        expected: String,
        actual: String,
    },

    #[snafu(display("failed to encode or decode inventory {name:?}"))]
    Codec {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("inventory backend request failed"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A loaded inventory plus the backend's opaque concurrency token.
#[derive(Clone, Debug)]
pub struct StoredInventory {
    pub inventory: Inventory,
    pub version: Option<String>,
}

/// Durable storage for inventory records.
///
/// Implementations must reject a `store` whose `version` no longer matches
/// the persisted state with [`StorageError::Conflict`], and must verify on
/// `load` that the persisted unique ID matches `reference.id`.
#[async_trait]
pub trait InventoryStorage: Send + Sync {
    /// Loads the record, or `None` when it does not exist.
    async fn load(&self, reference: &InventoryRef) -> Result<Option<StoredInventory>, StorageError>;

    /// Persists the record. `version` is `None` for a creation. Returns the
    /// new concurrency token.
    async fn store(
        &self,
        inventory: &Inventory,
        version: Option<String>,
    ) -> Result<String, StorageError>;

    /// Removes the record. Deleting an absent record is not an error.
    async fn delete(&self, reference: &InventoryRef) -> Result<(), StorageError>;
}
