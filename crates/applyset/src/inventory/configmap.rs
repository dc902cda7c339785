//! ConfigMap-backed inventory storage.
//!
//! Each entry is stored under one `data` key, the value being the
//! JSON-encoded [`ObjectEntry`]. The ConfigMap's `resourceVersion` acts as
//! the optimistic concurrency token and the inventory's unique ID lives in
//! the [`INVENTORY_ID_LABEL`] label, so the backing object survives being
//! renamed under the label strategy.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    Api,
    api::{DeleteParams, ObjectMeta, PostParams},
};
use snafu::ResultExt;

use crate::inventory::{
    INVENTORY_ID_LABEL, Inventory, InventoryRef, ObjectEntry,
    storage::{CodecSnafu, InventoryStorage, StorageError, StoredInventory},
};

#[derive(Clone)]
pub struct ConfigMapStorage {
    client: kube::Client,
}

impl ConfigMapStorage {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, reference: &InventoryRef) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &reference.namespace)
    }
}

#[async_trait::async_trait]
impl InventoryStorage for ConfigMapStorage {
    async fn load(&self, reference: &InventoryRef) -> Result<Option<StoredInventory>, StorageError> {
        let config_map = match self.api(reference).get_opt(&reference.name).await {
            Ok(Some(config_map)) => config_map,
            Ok(None) => return Ok(None),
            Err(source) => {
                return Err(StorageError::Backend {
                    source: Box::new(source),
                });
            }
        };

        let owner = config_map
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(INVENTORY_ID_LABEL))
            .cloned()
            .unwrap_or_default();
        if owner != reference.id {
            return Err(StorageError::WrongOwner {
                name: reference.name.clone(),
                expected: reference.id.clone(),
                actual: owner,
            });
        }

        let mut entries = Vec::new();
        for value in config_map.data.unwrap_or_default().into_values() {
            let entry: ObjectEntry = serde_json::from_str(&value).context(CodecSnafu {
                name: reference.name.clone(),
            })?;
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Some(StoredInventory {
            inventory: Inventory {
                reference: reference.clone(),
                entries,
            },
            version: config_map.metadata.resource_version,
        }))
    }

    async fn store(
        &self,
        inventory: &Inventory,
        version: Option<String>,
    ) -> Result<String, StorageError> {
        let reference = &inventory.reference;

        let mut data = BTreeMap::new();
        for entry in &inventory.entries {
            let key = format!(
                "{}_{}_{}_{}",
                entry.id.namespace, entry.id.name, entry.id.group_kind.group, entry.id.group_kind.kind
            );
            let value = serde_json::to_string(entry).context(CodecSnafu {
                name: reference.name.clone(),
            })?;
            data.insert(key, value);
        }

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(reference.name.clone()),
                namespace: Some(reference.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    INVENTORY_ID_LABEL.to_owned(),
                    reference.id.clone(),
                )])),
                resource_version: version.clone(),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..ConfigMap::default()
        };

        let api = self.api(reference);
        let result = match version {
            None => api.create(&PostParams::default(), &config_map).await,
            Some(_) => {
                api.replace(&reference.name, &PostParams::default(), &config_map)
                    .await
            }
        };

        match result {
            Ok(stored) => Ok(stored.metadata.resource_version.unwrap_or_default()),
            Err(kube::Error::Api(status)) if status.code == 409 => {
                Err(StorageError::Conflict {
                    name: reference.name.clone(),
                })
            }
            Err(source) => Err(StorageError::Backend {
                source: Box::new(source),
            }),
        }
    }

    async fn delete(&self, reference: &InventoryRef) -> Result<(), StorageError> {
        match self
            .api(reference)
            .delete(&reference.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(status)) if status.code == 404 => Ok(()),
            Err(source) => Err(StorageError::Backend {
                source: Box::new(source),
            }),
        }
    }
}
