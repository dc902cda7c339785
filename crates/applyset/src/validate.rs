//! Object and graph validation.
//!
//! Validation runs in two stages. The per-object stage checks each manifest
//! in isolation: addressability and parseable annotations. The graph stage
//! checks the assembled dependency graph for cycles and unresolvable
//! external references. How a finding affects the run depends on the
//! policy: `ExitEarly` turns the first finding into a terminal error,
//! `SkipInvalid` drops the offending objects (and everything transitively
//! depending on them) and carries on.

use std::{collections::HashMap, sync::Arc};

use kube::core::DynamicObject;
use snafu::Snafu;
use tracing::debug;

use crate::{
    annotations::{self, ApplyTimeMutation, DependsOn, depends_on, mutation},
    client::{self, ClusterClient},
    graph::{self, ObjectGraph},
    object::{ObjMetadata, ObjMetadataSet},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object is not addressable"))]
    Identity { source: crate::object::Error },

    #[snafu(display("invalid lifecycle annotation on {id}"))]
    Lifecycle {
        source: annotations::Error,
        id: ObjMetadata,
    },

    #[snafu(display("invalid depends-on annotation on {id}"))]
    DependsOn {
        source: depends_on::Error,
        id: ObjMetadata,
    },

    #[snafu(display("invalid apply-time-mutation annotation on {id}"))]
    Mutation {
        source: mutation::Error,
        id: ObjMetadata,
    },

    #[snafu(display("duplicate object {id} in the desired set"))]
    Duplicate { id: ObjMetadata },

    #[snafu(display("{id} depends on {dependency}, which is neither in the set nor in the cluster"))]
    ExternalDependency {
        id: ObjMetadata,
        dependency: ObjMetadata,
    },

    #[snafu(display("failed to look up external dependency {dependency} of {id}"))]
    ExternalDependencyCheck {
        source: client::Error,
        id: ObjMetadata,
        dependency: ObjMetadata,
    },

    #[snafu(transparent)]
    Cycle { source: graph::Error },
}

/// How validation findings affect the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValidationPolicy {
    /// The first invalid object terminates the run.
    #[default]
    ExitEarly,
    /// Invalid objects and their transitive dependents are dropped from
    /// the run; the rest proceeds.
    SkipInvalid,
}

/// One validation finding: the objects it removes from the run plus the
/// underlying error.
#[derive(Debug)]
pub struct Finding {
    pub identifiers: Vec<ObjMetadata>,
    pub error: Error,
}

/// Checks each manifest in isolation.
///
/// Returns the addressable, well-annotated objects keyed by identity, the
/// identity order of the input, and the findings for everything else.
/// Under `ExitEarly` the first finding is returned as `Err` instead.
pub fn check_objects(
    manifests: Vec<DynamicObject>,
    policy: ValidationPolicy,
) -> Result<(HashMap<ObjMetadata, DynamicObject>, ObjMetadataSet, Vec<Finding>), Error> {
    let mut objects = HashMap::new();
    let mut order = ObjMetadataSet::new();
    let mut findings = Vec::new();

    for manifest in manifests {
        match check_object(&manifest, &order) {
            Ok(id) => {
                order.insert(id.clone());
                objects.insert(id, manifest);
            }
            Err(error) => match policy {
                ValidationPolicy::ExitEarly => return Err(error),
                ValidationPolicy::SkipInvalid => {
                    let identifiers = ObjMetadata::from_object(&manifest)
                        .map(|id| vec![id])
                        .unwrap_or_default();
                    findings.push(Finding { identifiers, error });
                }
            },
        }
    }

    Ok((objects, order, findings))
}

fn check_object(manifest: &DynamicObject, seen: &ObjMetadataSet) -> Result<ObjMetadata, Error> {
    let id = ObjMetadata::from_object(manifest).map_err(|source| Error::Identity { source })?;

    if seen.contains(&id) {
        return Err(Error::Duplicate { id });
    }

    annotations::removal_prevented(manifest)
        .and(annotations::mutation_ignored(manifest))
        .map_err(|source| Error::Lifecycle {
            source,
            id: id.clone(),
        })?;
    DependsOn::from_object(manifest).map_err(|source| Error::DependsOn {
        source,
        id: id.clone(),
    })?;
    ApplyTimeMutation::from_object(manifest).map_err(|source| Error::Mutation {
        source,
        id: id.clone(),
    })?;

    Ok(id)
}

/// Checks the assembled graph: cycles and external references.
///
/// External references are acceptable only when the target already exists
/// in the cluster. Under `SkipInvalid`, the returned set contains every
/// object the findings remove from the run (offenders plus transitive
/// dependents).
pub async fn check_graph(
    graph: &ObjectGraph,
    client: &Arc<dyn ClusterClient>,
    policy: ValidationPolicy,
) -> Result<(ObjMetadataSet, Vec<Finding>), Error> {
    let mut findings = Vec::new();
    let mut removed = ObjMetadataSet::new();

    if let Err(error @ graph::Error::Cycle { .. }) = graph.sort_layers() {
        let graph::Error::Cycle { edges } = &error;
        let mut members = ObjMetadataSet::new();
        for (from, to) in edges {
            members.insert(from.clone());
            members.insert(to.clone());
        }

        match policy {
            ValidationPolicy::ExitEarly => return Err(error.into()),
            ValidationPolicy::SkipInvalid => {
                removed.extend(members.iter().cloned());
                removed.extend(graph.transitive_dependents(&members));
                findings.push(Finding {
                    identifiers: members.sorted(),
                    error: error.into(),
                });
            }
        }
    }

    for external in graph.external_dependencies() {
        let exists = client
            .get(&external.to)
            .await
            .map_err(|source| Error::ExternalDependencyCheck {
                source,
                id: external.from.clone(),
                dependency: external.to.clone(),
            })?
            .is_some();
        if exists {
            debug!(
                from = %external.from,
                to = %external.to,
                "external dependency resolved in cluster"
            );
            continue;
        }

        let error = Error::ExternalDependency {
            id: external.from.clone(),
            dependency: external.to.clone(),
        };
        match policy {
            ValidationPolicy::ExitEarly => return Err(error),
            ValidationPolicy::SkipInvalid => {
                let roots: ObjMetadataSet = [external.from.clone()].into_iter().collect();
                removed.insert(external.from.clone());
                removed.extend(graph.transitive_dependents(&roots));
                findings.push(Finding {
                    identifiers: vec![external.from.clone()],
                    error,
                });
            }
        }
    }

    Ok((removed, findings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClusterClient;

    fn manifest(yaml: &str) -> DynamicObject {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn valid_objects_pass() {
        let (objects, order, findings) = check_objects(
            vec![manifest(
                "
apiVersion: v1
kind: Pod
metadata:
  name: pod-a
  namespace: test
",
            )],
            ValidationPolicy::ExitEarly,
        )
        .unwrap();

        assert_eq!(objects.len(), 1);
        assert_eq!(order.len(), 1);
        assert!(findings.is_empty());
    }

    #[test]
    fn exit_early_surfaces_first_error() {
        let result = check_objects(
            vec![manifest(
                "
apiVersion: v1
kind: Pod
metadata:
  namespace: test
",
            )],
            ValidationPolicy::ExitEarly,
        );

        assert!(matches!(result, Err(Error::Identity { .. })));
    }

    #[test]
    fn skip_invalid_collects_findings() {
        let (objects, _, findings) = check_objects(
            vec![
                manifest(
                    "
apiVersion: v1
kind: Pod
metadata:
  name: good
  namespace: test
",
                ),
                manifest(
                    "
apiVersion: v1
kind: Pod
metadata:
  name: bad
  namespace: test
  annotations:
    cli-utils.sigs.k8s.io/on-remove: wrong-value
",
                ),
            ],
            ValidationPolicy::SkipInvalid,
        )
        .unwrap();

        assert_eq!(objects.len(), 1);
        assert_eq!(findings.len(), 1);
        assert!(matches!(findings[0].error, Error::Lifecycle { .. }));
        assert_eq!(
            findings[0].identifiers,
            vec![ObjMetadata::namespaced("", "Pod", "test", "bad")]
        );
    }

    #[test]
    fn duplicates_are_rejected() {
        let pod = manifest(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-a
  namespace: test
",
        );
        let result = check_objects(vec![pod.clone(), pod], ValidationPolicy::ExitEarly);
        assert!(matches!(result, Err(Error::Duplicate { .. })));
    }

    #[tokio::test]
    async fn external_dependency_must_exist_in_cluster() {
        let pod = manifest(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-a
  namespace: test
  annotations:
    config.kubernetes.io/depends-on: /namespaces/shared/ConfigMap/settings
",
        );
        let id = ObjMetadata::from_object(&pod).unwrap();
        let graph = ObjectGraph::build(
            &HashMap::from([(id.clone(), pod)]),
            &ObjMetadataSet::new(),
        );

        let client: Arc<dyn ClusterClient> = Arc::new(FakeClusterClient::default());
        let (removed, findings) = check_graph(&graph, &client, ValidationPolicy::SkipInvalid)
            .await
            .unwrap();
        assert!(removed.contains(&id));
        assert_eq!(findings.len(), 1);
        assert!(matches!(findings[0].error, Error::ExternalDependency { .. }));

        // Present in the cluster: the edge is fine.
        let fake = FakeClusterClient::default();
        fake.put_object(manifest(
            "
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: shared
",
        ));
        let client: Arc<dyn ClusterClient> = Arc::new(fake);
        let (removed, findings) = check_graph(&graph, &client, ValidationPolicy::SkipInvalid)
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn cycle_removes_members_and_dependents() {
        let pod_a = manifest(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-a
  namespace: test
  annotations:
    config.kubernetes.io/depends-on: /namespaces/test/Pod/pod-b
",
        );
        let pod_b = manifest(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-b
  namespace: test
  annotations:
    config.kubernetes.io/depends-on: /namespaces/test/Pod/pod-a
",
        );
        let pod_c = manifest(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-c
  namespace: test
  annotations:
    config.kubernetes.io/depends-on: /namespaces/test/Pod/pod-a
",
        );

        let objects: HashMap<_, _> = [pod_a, pod_b, pod_c]
            .into_iter()
            .map(|object| (ObjMetadata::from_object(&object).unwrap(), object))
            .collect();
        let graph = ObjectGraph::build(&objects, &ObjMetadataSet::new());
        let client: Arc<dyn ClusterClient> = Arc::new(FakeClusterClient::default());

        let (removed, findings) = check_graph(&graph, &client, ValidationPolicy::SkipInvalid)
            .await
            .unwrap();

        assert_eq!(removed.len(), 3, "cycle members and dependent are removed");
        assert_eq!(findings.len(), 1);
        let Error::Cycle { source: graph::Error::Cycle { edges } } = &findings[0].error else {
            unreachable!("expected cycle finding");
        };
        assert_eq!(edges.len(), 2);
    }
}
