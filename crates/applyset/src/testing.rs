//! In-memory test doubles for the engine's collaborators.
//!
//! Used by this crate's own unit and integration tests and usable by
//! downstream crates that want to exercise run logic without a cluster.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::DynamicObject;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{ClusterClient, Error, PatchOptions, PatchStrategy, PropagationPolicy},
    inventory::{Inventory, InventoryRef, InventoryStorage, StorageError, StoredInventory},
    object::{ObjMetadata, ObjMetadataSet},
    poll::{StatusEvent, StatusPhase, StatusPoller},
};

/// Parses a YAML manifest into a dynamic object, panicking on bad input.
pub fn manifest(yaml: &str) -> DynamicObject {
    serde_yaml::from_str(yaml).expect("test manifest must parse")
}

/// A cluster that lives in a map.
///
/// Applies deep-merge patches (null removes a key), assigns sequential
/// UIDs on creation, and counts every request so tests can assert on RPC
/// traffic. Objects can be seeded with [`put_object`](Self::put_object)
/// and made to fail actuation with [`fail_actuation`](Self::fail_actuation).
#[derive(Default)]
pub struct FakeClusterClient {
    state: Mutex<BTreeMap<ObjMetadata, DynamicObject>>,
    uid_counter: AtomicUsize,
    request_counter: AtomicUsize,
    fail_actuation: Mutex<ObjMetadataSet>,
    status_overrides: Mutex<HashMap<ObjMetadata, Value>>,
}

impl FakeClusterClient {
    /// Seeds an object as live cluster state, assigning a UID if absent.
    pub fn put_object(&self, mut object: DynamicObject) {
        let id = ObjMetadata::from_object(&object).expect("seeded object must be addressable");
        if object.metadata.uid.is_none() {
            object.metadata.uid = Some(self.next_uid());
        }
        self.state
            .lock()
            .expect("state lock poisoned")
            .insert(id, object);
    }

    /// Every create or patch of `id` will fail with a server error.
    pub fn fail_actuation(&self, id: ObjMetadata) {
        self.fail_actuation
            .lock()
            .expect("fail lock poisoned")
            .insert(id);
    }

    /// Deep-merges `status` into `id` whenever it is (re)applied, emulating
    /// a controller filling in runtime state.
    pub fn set_status_on_apply(&self, id: ObjMetadata, status: Value) {
        self.status_overrides
            .lock()
            .expect("status lock poisoned")
            .insert(id, status);
    }

    pub fn object(&self, id: &ObjMetadata) -> Option<DynamicObject> {
        self.state.lock().expect("state lock poisoned").get(id).cloned()
    }

    pub fn contains(&self, id: &ObjMetadata) -> bool {
        self.state.lock().expect("state lock poisoned").contains_key(id)
    }

    /// Total number of cluster requests seen, reads included.
    pub fn request_count(&self) -> usize {
        self.request_counter.load(Ordering::SeqCst)
    }

    fn next_uid(&self) -> String {
        format!("uid-{}", self.uid_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check_failure(&self, id: &ObjMetadata) -> Result<(), Error> {
        if self
            .fail_actuation
            .lock()
            .expect("fail lock poisoned")
            .contains(id)
        {
            return Err(Error::Api {
                source: kube::Error::Api(
                    kube::core::Status::failure(&format!("injected failure for {id}"), "InternalError")
                        .with_code(500)
                        .boxed(),
                ),
                id: id.clone(),
            });
        }
        Ok(())
    }

    fn apply_status_override(&self, id: &ObjMetadata, object: &mut DynamicObject) {
        let overrides = self.status_overrides.lock().expect("status lock poisoned");
        if let Some(status) = overrides.get(id) {
            let mut value = serde_json::to_value(&*object).expect("object serializes");
            deep_merge(&mut value, &serde_json::json!({ "status": status }));
            *object = serde_json::from_value(value).expect("merged object deserializes");
        }
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn get(&self, id: &ObjMetadata) -> Result<Option<DynamicObject>, Error> {
        self.request_counter.fetch_add(1, Ordering::SeqCst);
        Ok(self.object(id))
    }

    async fn create(
        &self,
        object: &DynamicObject,
        server_dry_run: bool,
    ) -> Result<DynamicObject, Error> {
        self.request_counter.fetch_add(1, Ordering::SeqCst);
        let id = ObjMetadata::from_object(object).map_err(|source| Error::Identity { source })?;
        self.check_failure(&id)?;

        let mut stored = object.clone();
        stored.metadata.uid = Some(self.next_uid());
        self.apply_status_override(&id, &mut stored);

        if !server_dry_run {
            self.state
                .lock()
                .expect("state lock poisoned")
                .insert(id, stored.clone());
        }
        Ok(stored)
    }

    async fn patch(
        &self,
        id: &ObjMetadata,
        patch: &Value,
        _strategy: PatchStrategy,
        options: &PatchOptions,
    ) -> Result<DynamicObject, Error> {
        self.request_counter.fetch_add(1, Ordering::SeqCst);
        self.check_failure(id)?;

        let current = self.object(id);
        let mut value = match &current {
            Some(existing) => serde_json::to_value(existing).expect("object serializes"),
            None => Value::Object(serde_json::Map::new()),
        };
        deep_merge(&mut value, patch);

        let mut stored: DynamicObject =
            serde_json::from_value(value).map_err(|_| Error::Api {
                source: kube::Error::Api(
                    kube::core::Status::failure(
                        "patch does not produce a valid object",
                        "Invalid",
                    )
                    .with_code(422)
                    .boxed(),
                ),
                id: id.clone(),
            })?;
        if stored.metadata.uid.is_none() {
            stored.metadata.uid = Some(self.next_uid());
        }
        self.apply_status_override(id, &mut stored);

        if !options.server_dry_run {
            self.state
                .lock()
                .expect("state lock poisoned")
                .insert(id.clone(), stored.clone());
        }
        Ok(stored)
    }

    async fn delete(
        &self,
        id: &ObjMetadata,
        _propagation: PropagationPolicy,
        server_dry_run: bool,
    ) -> Result<(), Error> {
        self.request_counter.fetch_add(1, Ordering::SeqCst);
        self.check_failure(id)?;
        if !server_dry_run {
            self.state.lock().expect("state lock poisoned").remove(id);
        }
        Ok(())
    }

    async fn watch(
        &self,
        id: &ObjMetadata,
    ) -> Result<BoxStream<'static, Result<DynamicObject, Error>>, Error> {
        self.request_counter.fetch_add(1, Ordering::SeqCst);
        let current = self.object(id);
        Ok(Box::pin(futures::stream::iter(current.into_iter().map(Ok))))
    }
}

/// JSON-merge-patch semantics: objects merge recursively, null removes,
/// everything else replaces.
fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(key);
                } else {
                    deep_merge(
                        base.entry(key.clone()).or_insert(Value::Null),
                        value,
                    );
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Inventory storage backed by a shared map, with the same optimistic
/// concurrency behavior as the ConfigMap backend.
#[derive(Clone, Default)]
pub struct InMemoryInventoryStorage {
    records: Arc<Mutex<HashMap<(String, String), (Inventory, u64)>>>,
}

#[async_trait]
impl InventoryStorage for InMemoryInventoryStorage {
    async fn load(&self, reference: &InventoryRef) -> Result<Option<StoredInventory>, StorageError> {
        let records = self.records.lock().expect("records lock poisoned");
        let Some((inventory, version)) =
            records.get(&(reference.namespace.clone(), reference.name.clone()))
        else {
            return Ok(None);
        };

        if inventory.reference.id != reference.id {
            return Err(StorageError::WrongOwner {
                name: reference.name.clone(),
                expected: reference.id.clone(),
                actual: inventory.reference.id.clone(),
            });
        }

        Ok(Some(StoredInventory {
            inventory: inventory.clone(),
            version: Some(version.to_string()),
        }))
    }

    async fn store(
        &self,
        inventory: &Inventory,
        version: Option<String>,
    ) -> Result<String, StorageError> {
        let mut records = self.records.lock().expect("records lock poisoned");
        let key = (
            inventory.reference.namespace.clone(),
            inventory.reference.name.clone(),
        );

        let current = records.get(&key).map(|(_, version)| *version);
        let expected = version.and_then(|version| version.parse::<u64>().ok());
        if current != expected {
            return Err(StorageError::Conflict {
                name: inventory.reference.name.clone(),
            });
        }

        let next = current.unwrap_or(0) + 1;
        records.insert(key, (inventory.clone(), next));
        Ok(next.to_string())
    }

    async fn delete(&self, reference: &InventoryRef) -> Result<(), StorageError> {
        self.records
            .lock()
            .expect("records lock poisoned")
            .remove(&(reference.namespace.clone(), reference.name.clone()));
        Ok(())
    }
}

impl InMemoryInventoryStorage {
    /// The persisted record, bypassing ownership checks. Test-side peek.
    pub fn record(&self, reference: &InventoryRef) -> Option<Inventory> {
        self.records
            .lock()
            .expect("records lock poisoned")
            .get(&(reference.namespace.clone(), reference.name.clone()))
            .map(|(inventory, _)| inventory.clone())
    }
}

/// A poller that equates existence with readiness.
///
/// Objects present in the fake cluster report `Current` (unless a phase
/// override says otherwise), absent objects report `NotFound`. Good enough
/// for runs whose fixtures do not model controller behavior.
pub struct FakeStatusPoller {
    client: Arc<FakeClusterClient>,
    overrides: Mutex<HashMap<ObjMetadata, StatusPhase>>,
    interval: Duration,
}

impl FakeStatusPoller {
    pub fn new(client: Arc<FakeClusterClient>) -> Self {
        Self {
            client,
            overrides: Mutex::new(HashMap::new()),
            interval: Duration::from_millis(5),
        }
    }

    /// Forces a fixed phase for one object, e.g. `Failed` or `InProgress`.
    pub fn override_phase(&self, id: ObjMetadata, phase: StatusPhase) {
        self.overrides
            .lock()
            .expect("overrides lock poisoned")
            .insert(id, phase);
    }
}

impl StatusPoller for FakeStatusPoller {
    fn poll(
        &self,
        ids: &ObjMetadataSet,
        cancel: CancellationToken,
    ) -> BoxStream<'static, StatusEvent> {
        let ids: Vec<ObjMetadata> = ids.iter().cloned().collect();
        let client = Arc::clone(&self.client);
        let overrides = self
            .overrides
            .lock()
            .expect("overrides lock poisoned")
            .clone();
        let interval = self.interval;

        let (tx, rx) = futures::channel::mpsc::channel(ids.len().max(1) * 2);
        tokio::spawn(async move {
            let mut tx = tx;
            let mut last_seen: HashMap<ObjMetadata, StatusPhase> = HashMap::new();

            loop {
                for id in &ids {
                    let phase = overrides.get(id).copied().unwrap_or_else(|| {
                        if client.contains(id) {
                            StatusPhase::Current
                        } else {
                            StatusPhase::NotFound
                        }
                    });
                    if last_seen.insert(id.clone(), phase) == Some(phase) {
                        continue;
                    }
                    let event = StatusEvent {
                        id: id.clone(),
                        phase,
                        message: String::new(),
                    };
                    if futures::SinkExt::send(&mut tx, event).await.is_err() {
                        return;
                    }
                }

                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        });

        Box::pin(rx)
    }
}
