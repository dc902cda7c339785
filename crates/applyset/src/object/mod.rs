//! Object identity.
//!
//! Every resource managed by the engine is identified by the triple of
//! group-kind, namespace and name. The triple deliberately erases the API
//! version: an object keeps its identity across version migrations, and the
//! inventory must keep matching it. The version needed for API calls is
//! resolved separately, see [`crate::client`].

use std::{fmt, str::FromStr};

use kube::core::{DynamicObject, GroupVersion, GroupVersionKind};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

pub mod path;
pub mod set;

pub use path::FieldPath;
pub use set::ObjMetadataSet;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object has no apiVersion/kind"))]
    MissingTypeMeta,

    #[snafu(display("object has no name"))]
    MissingName,

    #[snafu(display("failed to parse apiVersion {api_version:?}"))]
    ParseApiVersion {
        source: kube::core::gvk::ParseGroupVersionError,
        api_version: String,
    },
}

/// A Kubernetes group/kind pair, e.g. `Deployment.apps`.
///
/// The empty group is the core (legacy) group.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

impl From<&GroupVersionKind> for GroupKind {
    fn from(gvk: &GroupVersionKind) -> Self {
        Self {
            group: gvk.group.clone(),
            kind: gvk.kind.clone(),
        }
    }
}

/// The identity triple of a managed object.
///
/// Ordering is by group-kind, then namespace, then name, which keeps plans
/// and test output reproducible. Cluster-scoped objects carry an empty
/// namespace.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ObjMetadata {
    pub group_kind: GroupKind,
    pub namespace: String,
    pub name: String,
}

impl ObjMetadata {
    pub fn new(group_kind: GroupKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group_kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespaced(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(GroupKind::new(group, kind), namespace, name)
    }

    pub fn cluster_scoped(
        group: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(GroupKind::new(group, kind), "", name)
    }

    /// Extracts the identity triple from a dynamic object.
    pub fn from_object(object: &DynamicObject) -> Result<Self, Error> {
        let gvk = gvk_of(object)?;
        let name = object
            .metadata
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .context(MissingNameSnafu)?;

        Ok(Self {
            group_kind: GroupKind::from(&gvk),
            namespace: object.metadata.namespace.clone().unwrap_or_default(),
            name,
        })
    }

    pub fn is_namespace(&self) -> bool {
        self.group_kind.group.is_empty() && self.group_kind.kind == "Namespace"
    }

    pub fn is_crd(&self) -> bool {
        self.group_kind.group == "apiextensions.k8s.io"
            && self.group_kind.kind == "CustomResourceDefinition"
    }
}

impl fmt::Display for ObjMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.group_kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.group_kind, self.namespace, self.name)
        }
    }
}

/// Returns the full group/version/kind of a dynamic object.
pub fn gvk_of(object: &DynamicObject) -> Result<GroupVersionKind, Error> {
    let types = object.types.as_ref().context(MissingTypeMetaSnafu)?;
    if types.kind.is_empty() {
        return MissingTypeMetaSnafu.fail();
    }

    let group_version =
        GroupVersion::from_str(&types.api_version).context(ParseApiVersionSnafu {
            api_version: types.api_version.clone(),
        })?;

    Ok(group_version.with_kind(&types.kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_object(name: &str, namespace: &str) -> DynamicObject {
        serde_yaml::from_str(&format!(
            "
apiVersion: v1
kind: Pod
metadata:
  name: {name}
  namespace: {namespace}
"
        ))
        .unwrap()
    }

    #[test]
    fn identity_from_object() {
        let id = ObjMetadata::from_object(&pod_object("pod-a", "test")).unwrap();
        assert_eq!(id, ObjMetadata::namespaced("", "Pod", "test", "pod-a"));
        assert_eq!(id.to_string(), "Pod/test/pod-a");
    }

    #[test]
    fn identity_ignores_version() {
        let v1: DynamicObject = serde_yaml::from_str(
            "
apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx
  namespace: default
",
        )
        .unwrap();
        let v1beta1: DynamicObject = serde_yaml::from_str(
            "
apiVersion: apps/v1beta1
kind: Deployment
metadata:
  name: nginx
  namespace: default
",
        )
        .unwrap();

        assert_eq!(
            ObjMetadata::from_object(&v1).unwrap(),
            ObjMetadata::from_object(&v1beta1).unwrap()
        );
    }

    #[test]
    fn missing_name_is_rejected() {
        let object: DynamicObject = serde_yaml::from_str(
            "
apiVersion: v1
kind: Pod
metadata:
  namespace: test
",
        )
        .unwrap();

        assert!(matches!(
            ObjMetadata::from_object(&object),
            Err(Error::MissingName)
        ));
    }

    #[test]
    fn ordering_is_by_group_kind_then_namespace_then_name() {
        let mut ids = vec![
            ObjMetadata::namespaced("", "Pod", "b", "x"),
            ObjMetadata::namespaced("apps", "Deployment", "a", "y"),
            ObjMetadata::namespaced("", "Pod", "a", "z"),
            ObjMetadata::cluster_scoped("", "Namespace", "a"),
        ];
        ids.sort();

        assert_eq!(
            ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
            [
                "Namespace/a",
                "Pod/a/z",
                "Pod/b/x",
                "Deployment.apps/a/y",
            ]
        );
    }
}
