use super::*;

fn parse(manifest: &str) -> (ObjMetadata, DynamicObject) {
    let object: DynamicObject = serde_yaml::from_str(manifest).unwrap();
    (ObjMetadata::from_object(&object).unwrap(), object)
}

fn pod(name: &str, depends_on: Option<&str>) -> (ObjMetadata, DynamicObject) {
    let annotations = depends_on
        .map(|value| {
            format!(
                "
  annotations:
    config.kubernetes.io/depends-on: {value}"
            )
        })
        .unwrap_or_default();
    parse(&format!(
        "
apiVersion: v1
kind: Pod
metadata:
  name: {name}
  namespace: test{annotations}
"
    ))
}

fn objects(
    entries: impl IntoIterator<Item = (ObjMetadata, DynamicObject)>,
) -> HashMap<ObjMetadata, DynamicObject> {
    entries.into_iter().collect()
}

#[test]
fn layers_follow_depends_on() {
    let (id1, pod1) = pod("pod1", Some("/namespaces/test/Pod/pod2"));
    let (id2, pod2) = pod("pod2", None);

    let graph = ObjectGraph::build(&objects([(id1.clone(), pod1), (id2.clone(), pod2)]), &ObjMetadataSet::new());
    let layers = graph.sort_layers().unwrap();

    assert_eq!(layers, vec![vec![id2], vec![id1]]);
}

#[test]
fn layer_ties_break_by_identity() {
    let (id_c, pod_c) = pod("c", None);
    let (id_a, pod_a) = pod("a", None);
    let (id_b, pod_b) = pod("b", None);

    let graph = ObjectGraph::build(
        &objects([(id_c, pod_c), (id_a, pod_a), (id_b, pod_b)]),
        &ObjMetadataSet::new(),
    );
    let layers = graph.sort_layers().unwrap();

    assert_eq!(layers.len(), 1);
    assert_eq!(
        layers[0].iter().map(|id| &id.name).collect::<Vec<_>>(),
        ["a", "b", "c"]
    );
}

#[test]
fn cycle_is_reported_with_edges() {
    let (id_a, pod_a) = pod("pod-a", Some("/namespaces/test/Pod/pod-b"));
    let (id_b, pod_b) = pod("pod-b", Some("/namespaces/test/Pod/pod-a"));

    let graph = ObjectGraph::build(
        &objects([(id_a.clone(), pod_a), (id_b.clone(), pod_b)]),
        &ObjMetadataSet::new(),
    );

    let error = graph.sort_layers().unwrap_err();
    let Error::Cycle { edges } = error;
    assert_eq!(
        edges,
        vec![(id_a.clone(), id_b.clone()), (id_b, id_a)]
    );
}

#[test]
fn namespaced_object_depends_on_namespace_in_set() {
    let (pod_id, pod) = pod("pod1", None);
    let (ns_id, ns) = parse(
        "
apiVersion: v1
kind: Namespace
metadata:
  name: test
",
    );

    let graph = ObjectGraph::build(
        &objects([(pod_id.clone(), pod), (ns_id.clone(), ns)]),
        &ObjMetadataSet::new(),
    );

    assert_eq!(
        graph.dependencies_of(&pod_id),
        [ns_id.clone()].into_iter().collect()
    );
    let layers = graph.sort_layers().unwrap();
    assert_eq!(layers, vec![vec![ns_id], vec![pod_id]]);
}

#[test]
fn custom_resource_depends_on_its_crd() {
    let (crd_id, crd) = parse(
        "
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: databases.example.com
spec:
  group: example.com
  names:
    kind: Database
",
    );
    let (cr_id, cr) = parse(
        "
apiVersion: example.com/v1
kind: Database
metadata:
  name: primary
  namespace: test
",
    );

    let graph = ObjectGraph::build(
        &objects([(crd_id.clone(), crd), (cr_id.clone(), cr)]),
        &ObjMetadataSet::new(),
    );

    assert_eq!(
        graph.dependencies_of(&cr_id),
        [crd_id].into_iter().collect()
    );
}

#[test]
fn unresolved_reference_is_external() {
    let (id1, pod1) = pod("pod1", Some("/namespaces/other/Pod/elsewhere"));

    let graph = ObjectGraph::build(&objects([(id1.clone(), pod1)]), &ObjMetadataSet::new());

    assert_eq!(
        graph.external_dependencies(),
        [ExternalDependency {
            from: id1,
            to: ObjMetadata::namespaced("", "Pod", "other", "elsewhere"),
        }]
    );
}

#[test]
fn inventory_only_vertices_participate_in_layers() {
    let (id1, pod1) = pod("pod1", Some("/namespaces/test/Pod/pod2"));
    let id2 = ObjMetadata::namespaced("", "Pod", "test", "pod2");

    let graph = ObjectGraph::build(
        &objects([(id1.clone(), pod1)]),
        &[id2.clone()].into_iter().collect(),
    );

    let layers = graph.sort_layers().unwrap();
    assert_eq!(layers, vec![vec![id2], vec![id1]]);
}

#[test]
fn transitive_dependents_walk_reverse_edges() {
    let (id1, pod1) = pod("pod1", Some("/namespaces/test/Pod/pod2"));
    let (id2, pod2) = pod("pod2", Some("/namespaces/test/Pod/pod3"));
    let (id3, pod3) = pod("pod3", None);

    let graph = ObjectGraph::build(
        &objects([(id1.clone(), pod1), (id2.clone(), pod2), (id3.clone(), pod3)]),
        &ObjMetadataSet::new(),
    );

    let dependents = graph.transitive_dependents(&[id3].into_iter().collect());
    assert!(dependents.contains(&id2));
    assert!(dependents.contains(&id1));
    assert_eq!(dependents.len(), 2);
}
