//! The contract between the orchestrator and the cluster API.
//!
//! The engine only ever talks to the cluster through [`ClusterClient`], so
//! runs can execute against the real API server ([`KubeClusterClient`]) or
//! an in-memory fake in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::DynamicObject;
use snafu::Snafu;
use strum::Display;

use crate::object::{GroupKind, ObjMetadata};

mod kube_client;

pub use kube_client::KubeClusterClient;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster request for {id} failed"))]
    Api { source: kube::Error, id: ObjMetadata },

    #[snafu(display("API discovery failed"))]
    Discovery { source: kube::Error },

    #[snafu(display("no served resource found for {group_kind}"))]
    UnknownResource { group_kind: GroupKind },

    #[snafu(display("object is not addressable"))]
    Identity { source: crate::object::Error },
}

impl Error {
    /// Whether the underlying failure was a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Api {
                source: kube::Error::Api(response),
                ..
            } if response.code == 404
        )
    }
}

/// How a change is written to the cluster.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum PatchStrategy {
    StrategicMerge,
    JsonMerge,
    ServerSideApply,
}

/// The default client-side patch strategy for a kind: strategic merge for
/// built-in API groups, JSON merge for everything else.
pub fn default_patch_strategy(group_kind: &GroupKind) -> PatchStrategy {
    let group = group_kind.group.as_str();
    if group.is_empty() || group == "apps" || group == "batch" || group == "policy"
        || group == "autoscaling" || group.ends_with(".k8s.io")
    {
        PatchStrategy::StrategicMerge
    } else {
        PatchStrategy::JsonMerge
    }
}

/// Deletion propagation, mirroring the cluster's semantics.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum PropagationPolicy {
    Foreground,
    #[default]
    Background,
    Orphan,
}

/// Whether and where a run is simulated.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum DryRunStrategy {
    /// Changes are actuated.
    #[default]
    None,
    /// No state-changing request leaves the process.
    Client,
    /// Requests carry the server-side dry-run flag.
    Server,
}

impl DryRunStrategy {
    pub fn client_dry_run(self) -> bool {
        matches!(self, Self::Client)
    }

    pub fn server_dry_run(self) -> bool {
        matches!(self, Self::Server)
    }

    /// Whether any kind of simulation is active.
    pub fn is_dry_run(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Options for a single patch request.
#[derive(Clone, Debug)]
pub struct PatchOptions {
    pub field_manager: String,
    pub force_conflicts: bool,
    pub server_dry_run: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            field_manager: "applyset".to_owned(),
            force_conflicts: false,
            server_dry_run: false,
        }
    }
}

/// Thin, thread-safe contract over cluster CRUD.
///
/// Implementations resolve the API version behind each [`ObjMetadata`]
/// themselves; the identity triple deliberately does not carry one.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches the current state of an object, `None` when absent.
    async fn get(&self, id: &ObjMetadata) -> Result<Option<DynamicObject>, Error>;

    /// Creates an object.
    async fn create(
        &self,
        object: &DynamicObject,
        server_dry_run: bool,
    ) -> Result<DynamicObject, Error>;

    /// Patches an object with the given strategy. The patch document is a
    /// full manifest for [`PatchStrategy::ServerSideApply`] and a (partial)
    /// merge document otherwise.
    async fn patch(
        &self,
        id: &ObjMetadata,
        patch: &serde_json::Value,
        strategy: PatchStrategy,
        options: &PatchOptions,
    ) -> Result<DynamicObject, Error>;

    /// Deletes an object. Deleting an absent object is not an error.
    async fn delete(
        &self,
        id: &ObjMetadata,
        propagation: PropagationPolicy,
        server_dry_run: bool,
    ) -> Result<(), Error>;

    /// Streams state changes of a single object.
    async fn watch(
        &self,
        id: &ObjMetadata,
    ) -> Result<BoxStream<'static, Result<DynamicObject, Error>>, Error>;
}
