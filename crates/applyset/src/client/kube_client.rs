//! [`ClusterClient`] backed by a real API server connection.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use kube::{
    Api, Discovery,
    api::{DeleteParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams},
    core::{DynamicObject, GroupVersion, discovery::ApiResource},
};
use snafu::ResultExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    client::{
        ApiSnafu, ClusterClient, DiscoverySnafu, Error, IdentitySnafu, PatchOptions,
        PatchStrategy, PropagationPolicy,
    },
    object::{self, GroupKind, ObjMetadata},
};

/// Resolves kinds through API discovery and issues requests through
/// [`kube::Api`] over erased dynamic objects.
///
/// Discovery results are cached; a cache miss triggers one rediscovery so
/// kinds served by CRDs applied earlier in the same run are found.
pub struct KubeClusterClient {
    client: kube::Client,
    resources: Arc<RwLock<HashMap<GroupKind, ApiResource>>>,
}

impl KubeClusterClient {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            resources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn resolve(&self, group_kind: &GroupKind) -> Result<ApiResource, Error> {
        if let Some(resource) = self.resources.read().await.get(group_kind) {
            return Ok(resource.clone());
        }

        debug!(%group_kind, "kind not cached, running API discovery");
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .context(DiscoverySnafu)?;

        let mut cache = self.resources.write().await;
        for group in discovery.groups() {
            for (resource, _capabilities) in group.recommended_resources() {
                cache.insert(
                    GroupKind::new(resource.group.clone(), resource.kind.clone()),
                    resource,
                );
            }
        }

        cache
            .get(group_kind)
            .cloned()
            .ok_or_else(|| Error::UnknownResource {
                group_kind: group_kind.clone(),
            })
    }

    /// Prefer the version named by the object itself so apply round-trips
    /// exactly; fall back to the discovered resource.
    async fn resource_for_object(&self, object: &DynamicObject) -> Result<ApiResource, Error> {
        let gvk = object::gvk_of(object).context(IdentitySnafu)?;
        let discovered = self.resolve(&GroupKind::from(&gvk)).await?;
        if discovered.version == gvk.version {
            return Ok(discovered);
        }
        let api_version = GroupVersion {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
        }
        .api_version();
        Ok(ApiResource {
            group: gvk.group,
            version: gvk.version,
            api_version,
            kind: gvk.kind,
            plural: discovered.plural,
        })
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }

    async fn api_for_id(&self, id: &ObjMetadata) -> Result<Api<DynamicObject>, Error> {
        let resource = self.resolve(&id.group_kind).await?;
        Ok(self.api(&resource, &id.namespace))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, id: &ObjMetadata) -> Result<Option<DynamicObject>, Error> {
        self.api_for_id(id)
            .await?
            .get_opt(&id.name)
            .await
            .context(ApiSnafu { id: id.clone() })
    }

    async fn create(
        &self,
        object: &DynamicObject,
        server_dry_run: bool,
    ) -> Result<DynamicObject, Error> {
        let id = ObjMetadata::from_object(object).context(IdentitySnafu)?;
        let resource = self.resource_for_object(object).await?;

        let params = PostParams {
            dry_run: server_dry_run,
            ..PostParams::default()
        };
        self.api(&resource, &id.namespace)
            .create(&params, object)
            .await
            .context(ApiSnafu { id })
    }

    async fn patch(
        &self,
        id: &ObjMetadata,
        patch: &serde_json::Value,
        strategy: PatchStrategy,
        options: &PatchOptions,
    ) -> Result<DynamicObject, Error> {
        let api = self.api_for_id(id).await?;

        let mut params = match strategy {
            PatchStrategy::ServerSideApply => {
                let params = PatchParams::apply(&options.field_manager);
                if options.force_conflicts {
                    params.force()
                } else {
                    params
                }
            }
            PatchStrategy::StrategicMerge | PatchStrategy::JsonMerge => PatchParams::default(),
        };
        params.dry_run = options.server_dry_run;

        let result = match strategy {
            PatchStrategy::ServerSideApply => {
                api.patch(&id.name, &params, &Patch::Apply(patch.clone())).await
            }
            PatchStrategy::StrategicMerge => {
                api.patch(&id.name, &params, &Patch::Strategic(patch.clone()))
                    .await
            }
            PatchStrategy::JsonMerge => {
                api.patch(&id.name, &params, &Patch::Merge(patch.clone())).await
            }
        };

        match result {
            Ok(patched) => Ok(patched),
            // Kinds without strategic merge support (aggregated APIs and
            // some CRD setups) answer 415; retry as a JSON merge.
            Err(kube::Error::Api(response))
                if response.code == 415 && strategy == PatchStrategy::StrategicMerge =>
            {
                api.patch(&id.name, &params, &Patch::Merge(patch.clone()))
                    .await
                    .context(ApiSnafu { id: id.clone() })
            }
            Err(source) => Err(source).context(ApiSnafu { id: id.clone() }),
        }
    }

    async fn delete(
        &self,
        id: &ObjMetadata,
        propagation: PropagationPolicy,
        server_dry_run: bool,
    ) -> Result<(), Error> {
        let params = DeleteParams {
            dry_run: server_dry_run,
            propagation_policy: Some(match propagation {
                PropagationPolicy::Foreground => kube::api::PropagationPolicy::Foreground,
                PropagationPolicy::Background => kube::api::PropagationPolicy::Background,
                PropagationPolicy::Orphan => kube::api::PropagationPolicy::Orphan,
            }),
            ..DeleteParams::default()
        };

        match self.api_for_id(id).await?.delete(&id.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(source).context(ApiSnafu { id: id.clone() }),
        }
    }

    async fn watch(
        &self,
        id: &ObjMetadata,
    ) -> Result<BoxStream<'static, Result<DynamicObject, Error>>, Error> {
        let api = self.api_for_id(id).await?;
        let params = WatchParams::default().fields(&format!("metadata.name={}", id.name));

        let stream = api
            .watch(&params, "0")
            .await
            .context(ApiSnafu { id: id.clone() })?;

        let id = id.clone();
        Ok(stream
            .map_err(move |source| Error::Api {
                source,
                id: id.clone(),
            })
            .try_filter_map(|event| async move {
                Ok(match event {
                    WatchEvent::Added(object)
                    | WatchEvent::Modified(object)
                    | WatchEvent::Deleted(object) => Some(object),
                    WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
                })
            })
            .boxed())
    }
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}
