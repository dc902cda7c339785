//! Load/merge/save orchestration over an [`InventoryStorage`] backend.

use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, warn};

use crate::inventory::{Inventory, InventoryRef, InventoryStorage, StorageError};

/// How often a conflicting save is retried before giving up.
const DEFAULT_SAVE_ATTEMPTS: usize = 4;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load inventory {name:?}", name = reference.name))]
    Load {
        source: StorageError,
        reference: InventoryRef,
    },

    #[snafu(display(
        "failed to persist inventory {name:?} after {attempts} attempts",
        name = reference.name
    ))]
    Conflict {
        reference: InventoryRef,
        attempts: usize,
    },

    #[snafu(display("failed to persist inventory {name:?}", name = reference.name))]
    Store {
        source: StorageError,
        reference: InventoryRef,
    },

    #[snafu(display(
        "refusing to delete inventory {name:?}: entries are not all in terminal success or skip states",
        name = reference.name
    ))]
    IncompleteTeardown { reference: InventoryRef },

    #[snafu(display("failed to delete inventory {name:?}", name = reference.name))]
    Delete {
        source: StorageError,
        reference: InventoryRef,
    },
}

/// The engine's view of the persisted inventory.
///
/// All mutation of the persisted record goes through this client, which
/// serializes saves and absorbs optimistic-concurrency conflicts by
/// reloading and re-merging outcomes.
pub struct InventoryClient<S> {
    storage: S,
    save_attempts: usize,
}

impl<S: InventoryStorage> InventoryClient<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            save_attempts: DEFAULT_SAVE_ATTEMPTS,
        }
    }

    pub fn with_save_attempts(mut self, attempts: usize) -> Self {
        self.save_attempts = attempts.max(1);
        self
    }

    /// Loads the persisted inventory, returning an empty record when none
    /// exists yet.
    pub async fn load<'a>(&'a self, reference: &'a InventoryRef) -> Result<Inventory, Error> {
        let stored = self
            .storage
            .load(reference)
            .await
            .context(LoadSnafu { reference: reference.clone() })?;

        Ok(match stored {
            Some(stored) => stored.inventory,
            None => Inventory::empty(reference.clone()),
        })
    }

    /// Persists `inventory`, retrying on concurrent modification.
    ///
    /// On every attempt the persisted record is reloaded and our entries
    /// take precedence over stale persisted ones; entries added to the
    /// record by someone else in the meantime are preserved.
    pub async fn save<'a>(&'a self, inventory: &'a Inventory) -> Result<(), Error> {
        let reference = &inventory.reference;

        for attempt in 1..=self.save_attempts {
            let stored = self
                .storage
                .load(reference)
                .await
                .context(LoadSnafu { reference: reference.clone() })?;

            let (version, merged) = match stored {
                Some(stored) => {
                    let mut merged = inventory.clone();
                    for entry in stored.inventory.entries {
                        if merged.entry(&entry.id).is_none() {
                            merged.entries.push(entry);
                        }
                    }
                    (stored.version, merged)
                }
                None => (None, inventory.clone()),
            };

            match self.storage.store(&merged, version).await {
                Ok(_) => {
                    debug!(
                        inventory = reference.name,
                        entries = merged.entries.len(),
                        "persisted inventory"
                    );
                    return Ok(());
                }
                Err(StorageError::Conflict { .. }) if attempt < self.save_attempts => {
                    warn!(
                        inventory = reference.name,
                        attempt, "inventory save conflicted, retrying"
                    );
                }
                Err(StorageError::Conflict { .. }) => {
                    return ConflictSnafu {
                        reference: reference.clone(),
                        attempts: self.save_attempts,
                    }
                    .fail();
                }
                Err(source) => {
                    return Err(source).context(StoreSnafu {
                        reference: reference.clone(),
                    });
                }
            }
        }

        ConflictSnafu {
            reference: reference.clone(),
            attempts: self.save_attempts,
        }
        .fail()
    }

    /// Removes the persisted record backing `inventory`.
    ///
    /// Refuses when any entry has not reached a terminal success or skip
    /// state, which would orphan the corresponding cluster object.
    pub async fn delete<'a>(&'a self, inventory: &'a Inventory) -> Result<(), Error> {
        let reference = &inventory.reference;
        ensure!(
            inventory.is_teardown_complete(),
            IncompleteTeardownSnafu {
                reference: reference.clone(),
            }
        );

        self.storage
            .delete(reference)
            .await
            .context(DeleteSnafu {
                reference: reference.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        inventory::{ActuationStatus, ObjectEntry, ReconcileStatus, Strategy},
        object::ObjMetadata,
        testing::InMemoryInventoryStorage,
    };

    fn reference() -> InventoryRef {
        InventoryRef::new("group", "test", "inventory-1")
    }

    fn entry(name: &str, strategy: Strategy) -> ObjectEntry {
        ObjectEntry {
            id: ObjMetadata::namespaced("", "Pod", "test", name),
            uid: format!("uid-{name}"),
            strategy,
            actuation: ActuationStatus::Succeeded,
            reconcile: ReconcileStatus::Succeeded,
        }
    }

    #[tokio::test]
    async fn load_of_absent_record_is_empty() {
        let client = InventoryClient::new(InMemoryInventoryStorage::default());
        let inventory = client.load(&reference()).await.unwrap();
        assert!(inventory.entries.is_empty());
        assert_eq!(inventory.reference, reference());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let client = InventoryClient::new(InMemoryInventoryStorage::default());
        let mut inventory = Inventory::empty(reference());
        inventory.entries.push(entry("a", Strategy::Apply));

        client.save(&inventory).await.unwrap();
        assert_eq!(client.load(&reference()).await.unwrap(), inventory);

        // Idempotent: a second save with the same content succeeds.
        client.save(&inventory).await.unwrap();
        assert_eq!(client.load(&reference()).await.unwrap(), inventory);
    }

    #[tokio::test]
    async fn save_preserves_foreign_entries_on_remerge() {
        let storage = InMemoryInventoryStorage::default();
        let client = InventoryClient::new(storage.clone());

        let mut theirs = Inventory::empty(reference());
        theirs.entries.push(entry("foreign", Strategy::Apply));
        client.save(&theirs).await.unwrap();

        let mut ours = Inventory::empty(reference());
        ours.entries.push(entry("ours", Strategy::Apply));
        client.save(&ours).await.unwrap();

        let loaded = client.load(&reference()).await.unwrap();
        let names: Vec<_> = loaded.entries.iter().map(|e| e.id.name.clone()).collect();
        assert_eq!(names, ["ours", "foreign"]);
    }

    #[tokio::test]
    async fn delete_refuses_incomplete_teardown() {
        let client = InventoryClient::new(InMemoryInventoryStorage::default());
        let mut inventory = Inventory::empty(reference());
        let mut pending = entry("a", Strategy::Delete);
        pending.actuation = ActuationStatus::Failed;
        inventory.entries.push(pending);
        client.save(&inventory).await.unwrap();

        assert!(matches!(
            client.delete(&inventory).await,
            Err(Error::IncompleteTeardown { .. })
        ));

        inventory.entries[0].actuation = ActuationStatus::Succeeded;
        client.delete(&inventory).await.unwrap();
        assert!(client.load(&reference()).await.unwrap().entries.is_empty());
    }
}
