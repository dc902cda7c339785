//! The durable membership record of an applied object group.
//!
//! The inventory is what makes pruning possible: it remembers which objects
//! earlier runs applied under a group name, together with their UIDs and the
//! outcome of the last actuation. It is persisted in the cluster through an
//! [`InventoryStorage`] backend and updated at well-defined points of a run
//! so that a crash never strands applied resources.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::object::{ObjMetadata, ObjMetadataSet};

pub mod client;
pub mod configmap;
pub mod storage;

pub use client::{Error, InventoryClient};
pub use configmap::ConfigMapStorage;
pub use storage::{InventoryStorage, StorageError, StoredInventory};

/// Label carrying the unique inventory ID on the backing object.
pub const INVENTORY_ID_LABEL: &str = "cli-utils.sigs.k8s.io/inventory-id";

/// How ownership conflicts between inventories are resolved on apply.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum InventoryPolicy {
    /// The object must already belong to this inventory or to none while
    /// being absent from the cluster.
    #[default]
    MustMatch,
    /// Objects without any recorded owner may be adopted.
    AdoptIfNoInventory,
    /// Ownership is always taken over.
    AdoptAll,
}

/// Identifies one persisted inventory.
///
/// With the *Name* strategy the name carries the identity and `id` must
/// match on load; with the *Label* strategy the durable `id` label carries
/// it and the name is replaceable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRef {
    pub name: String,
    pub namespace: String,
    /// The unique ID recorded on managed objects as their owner.
    pub id: String,
}

impl InventoryRef {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

/// The intended actuation of an inventory entry.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    #[default]
    Apply,
    Delete,
}

/// Whether the actuation RPC for an entry has happened, and how it went.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuationStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

/// Whether the cluster reached the entry's desired state.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Timeout,
    Skipped,
}

/// One row of the inventory.
///
/// Invariant: when `strategy` is [`Strategy::Apply`] and `actuation` is
/// [`ActuationStatus::Succeeded`], `uid` is non-empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub id: ObjMetadata,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub actuation: ActuationStatus,
    #[serde(default)]
    pub reconcile: ReconcileStatus,
}

impl ObjectEntry {
    pub fn pending(id: ObjMetadata, strategy: Strategy) -> Self {
        Self {
            id,
            strategy,
            ..Self::default()
        }
    }

    /// Terminal means the run finished dealing with this entry, whether or
    /// not it got what it wanted.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.actuation, ActuationStatus::Pending)
            && !matches!(self.reconcile, ReconcileStatus::Pending)
    }
}

/// The persisted inventory: identity plus the ordered entry list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub reference: InventoryRef,
    pub entries: Vec<ObjectEntry>,
}

impl Inventory {
    pub fn empty(reference: InventoryRef) -> Self {
        Self {
            reference,
            entries: Vec::new(),
        }
    }

    pub fn ids(&self) -> ObjMetadataSet {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }

    pub fn entry(&self, id: &ObjMetadata) -> Option<&ObjectEntry> {
        self.entries.iter().find(|entry| &entry.id == id)
    }

    pub fn entry_mut(&mut self, id: &ObjMetadata) -> Option<&mut ObjectEntry> {
        self.entries.iter_mut().find(|entry| &entry.id == id)
    }

    pub fn uid_of(&self, id: &ObjMetadata) -> Option<&str> {
        self.entry(id)
            .map(|entry| entry.uid.as_str())
            .filter(|uid| !uid.is_empty())
    }

    pub fn remove(&mut self, id: &ObjMetadata) {
        self.entries.retain(|entry| &entry.id != id);
    }

    /// The plan-time union of the run's object sets with this inventory:
    /// desired objects become pending Apply entries (keeping any recorded
    /// UID), prune candidates become pending Delete entries, and entries
    /// in neither set (e.g. objects dropped by validation) are carried
    /// over untouched.
    pub fn merge(&self, desired: &ObjMetadataSet, prune: &ObjMetadataSet) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len() + desired.len());
        for id in desired {
            let mut entry = ObjectEntry::pending(id.clone(), Strategy::Apply);
            if let Some(uid) = self.uid_of(id) {
                entry.uid = uid.to_owned();
            }
            entries.push(entry);
        }
        for entry in &self.entries {
            if desired.contains(&entry.id) {
                continue;
            }
            if prune.contains(&entry.id) {
                let mut pending = ObjectEntry::pending(entry.id.clone(), Strategy::Delete);
                pending.uid = entry.uid.clone();
                entries.push(pending);
            } else {
                entries.push(entry.clone());
            }
        }

        Self {
            reference: self.reference.clone(),
            entries,
        }
    }

    /// Whether every entry finished in a success or skip state, i.e. the
    /// record may be deleted without orphaning anything.
    pub fn is_teardown_complete(&self) -> bool {
        self.entries.iter().all(|entry| {
            matches!(
                entry.actuation,
                ActuationStatus::Succeeded | ActuationStatus::Skipped
            ) && matches!(
                entry.reconcile,
                ReconcileStatus::Succeeded | ReconcileStatus::Skipped
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str) -> ObjMetadata {
        ObjMetadata::namespaced("", "Pod", "test", name)
    }

    fn reference() -> InventoryRef {
        InventoryRef::new("group", "test", "inventory-1")
    }

    #[test]
    fn merge_unions_desired_and_previous() {
        let mut current = Inventory::empty(reference());
        current.entries = vec![
            ObjectEntry {
                id: pod("old"),
                uid: "uid-old".into(),
                strategy: Strategy::Apply,
                actuation: ActuationStatus::Succeeded,
                reconcile: ReconcileStatus::Succeeded,
            },
            ObjectEntry {
                id: pod("kept"),
                uid: "uid-kept".into(),
                strategy: Strategy::Apply,
                actuation: ActuationStatus::Succeeded,
                reconcile: ReconcileStatus::Succeeded,
            },
        ];

        let desired: ObjMetadataSet = [pod("kept"), pod("new")].into_iter().collect();
        let prune: ObjMetadataSet = [pod("old")].into_iter().collect();
        let merged = current.merge(&desired, &prune);

        assert_eq!(merged.entries.len(), 3);
        assert_eq!(
            merged.entry(&pod("kept")),
            Some(&ObjectEntry {
                id: pod("kept"),
                uid: "uid-kept".into(),
                strategy: Strategy::Apply,
                actuation: ActuationStatus::Pending,
                reconcile: ReconcileStatus::Pending,
            })
        );
        assert_eq!(merged.entry(&pod("new")).unwrap().uid, "");
        assert_eq!(
            merged.entry(&pod("old")).unwrap().strategy,
            Strategy::Delete
        );
        assert_eq!(merged.entry(&pod("old")).unwrap().uid, "uid-old");
    }

    #[test]
    fn teardown_completeness() {
        let mut inventory = Inventory::empty(reference());
        inventory.entries = vec![ObjectEntry {
            id: pod("a"),
            uid: "uid-a".into(),
            strategy: Strategy::Delete,
            actuation: ActuationStatus::Succeeded,
            reconcile: ReconcileStatus::Succeeded,
        }];
        assert!(inventory.is_teardown_complete());

        inventory.entries.push(ObjectEntry {
            id: pod("b"),
            uid: String::new(),
            strategy: Strategy::Delete,
            actuation: ActuationStatus::Failed,
            reconcile: ReconcileStatus::Skipped,
        });
        assert!(!inventory.is_teardown_complete());
    }
}
