//! The dependency graph over one run's object set.
//!
//! Vertices are object identities; the unstructured payloads stay in the
//! caller's side table. An edge `A -> B` means `A` depends on `B`: `B` is
//! applied (and reconciled) before `A`, and `A` is pruned before `B`.
//!
//! Edges come from three places: explicit `depends-on` annotations,
//! apply-time-mutation source references, and implicit containment (a
//! namespaced object depends on its Namespace, a custom resource on its
//! CRD) whenever the target is part of the set. Edges whose target is not
//! in the set are collected separately as external dependencies; the
//! validator decides whether they are acceptable.

use std::collections::HashMap;

use itertools::Itertools;
use kube::core::DynamicObject;
use petgraph::{
    Direction,
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
};
use snafu::Snafu;

use crate::{
    annotations::{ApplyTimeMutation, DependsOn},
    object::{GroupKind, ObjMetadata, ObjMetadataSet},
};

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("dependency cycle: {}", format_edges(edges)))]
    Cycle { edges: Vec<(ObjMetadata, ObjMetadata)> },
}

fn format_edges(edges: &[(ObjMetadata, ObjMetadata)]) -> String {
    edges
        .iter()
        .map(|(from, to)| format!("{from} -> {to}"))
        .join(", ")
}

/// Why an edge exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    DependsOn,
    MutationSource,
    Namespace,
    CrdInstance,
}

/// An edge whose target is outside the vertex set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalDependency {
    pub from: ObjMetadata,
    pub to: ObjMetadata,
}

pub struct ObjectGraph {
    graph: DiGraph<ObjMetadata, EdgeKind>,
    indices: HashMap<ObjMetadata, NodeIndex>,
    external: Vec<ExternalDependency>,
}

impl ObjectGraph {
    /// Builds the graph over the union of `objects` (desired, with payloads)
    /// and `inventory_only` (prune candidates without payloads).
    ///
    /// Annotations that fail to parse are treated as absent here; the
    /// validator rejects such objects before planning.
    pub fn build(
        objects: &HashMap<ObjMetadata, DynamicObject>,
        inventory_only: &ObjMetadataSet,
    ) -> Self {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        // Stable vertex numbering keeps layer tie-breaks deterministic.
        let mut ids: Vec<ObjMetadata> = objects.keys().cloned().collect();
        ids.sort();
        for id in ids.iter().chain(inventory_only.iter()) {
            if !indices.contains_key(id) {
                let index = graph.add_node(id.clone());
                indices.insert(id.clone(), index);
            }
        }

        let crd_owners = crd_owners(objects);

        let mut this = Self {
            graph,
            indices,
            external: Vec::new(),
        };

        for id in &ids {
            let object = &objects[id];

            if let Ok(depends_on) = DependsOn::from_object(object) {
                for target in depends_on.iter() {
                    this.add_dependency(id, target, EdgeKind::DependsOn);
                }
            }
            if let Ok(mutation) = ApplyTimeMutation::from_object(object) {
                for target in mutation.source_ids(&id.namespace) {
                    this.add_dependency(id, &target, EdgeKind::MutationSource);
                }
            }

            if !id.namespace.is_empty() {
                let namespace = ObjMetadata::cluster_scoped("", "Namespace", id.namespace.clone());
                if this.indices.contains_key(&namespace) {
                    this.add_dependency(id, &namespace, EdgeKind::Namespace);
                }
            }
            if let Some(crd) = crd_owners.get(&id.group_kind) {
                this.add_dependency(id, crd, EdgeKind::CrdInstance);
            }
        }

        this
    }

    fn add_dependency(&mut self, from: &ObjMetadata, to: &ObjMetadata, kind: EdgeKind) {
        if from == to && kind != EdgeKind::DependsOn && kind != EdgeKind::MutationSource {
            return;
        }
        match (self.indices.get(from), self.indices.get(to)) {
            (Some(&from_index), Some(&to_index)) => {
                if !self
                    .graph
                    .edges_connecting(from_index, to_index)
                    .any(|edge| *edge.weight() == kind)
                {
                    self.graph.add_edge(from_index, to_index, kind);
                }
            }
            _ => self.external.push(ExternalDependency {
                from: from.clone(),
                to: to.clone(),
            }),
        }
    }

    /// Edges pointing at objects outside the vertex set.
    pub fn external_dependencies(&self) -> &[ExternalDependency] {
        &self.external
    }

    /// Direct dependencies of `id` (the objects it must wait for).
    pub fn dependencies_of(&self, id: &ObjMetadata) -> ObjMetadataSet {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Direct dependents of `id` (the objects waiting for it).
    pub fn dependents_of(&self, id: &ObjMetadata) -> ObjMetadataSet {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &ObjMetadata, direction: Direction) -> ObjMetadataSet {
        let Some(&index) = self.indices.get(id) else {
            return ObjMetadataSet::new();
        };
        self.graph
            .neighbors_directed(index, direction)
            .map(|neighbor| self.graph[neighbor].clone())
            .collect()
    }

    /// All objects transitively depending on any of `roots`, excluding the
    /// roots themselves.
    pub fn transitive_dependents(&self, roots: &ObjMetadataSet) -> ObjMetadataSet {
        let mut stack: Vec<NodeIndex> = roots
            .iter()
            .filter_map(|id| self.indices.get(id).copied())
            .collect();
        let mut seen = ObjMetadataSet::new();

        while let Some(index) = stack.pop() {
            for dependent in self.graph.neighbors_directed(index, Direction::Incoming) {
                let id = self.graph[dependent].clone();
                if !roots.contains(&id) && seen.insert(id) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Partitions the vertices into topological layers.
    ///
    /// Every object in layer `i` has all of its dependencies in layers
    /// `0..i`. Within a layer, objects are ordered by identity. A cycle
    /// yields [`Error::Cycle`] carrying the edges of every strongly
    /// connected component involved.
    pub fn sort_layers(&self) -> Result<Vec<Vec<ObjMetadata>>, Error> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| {
                (
                    index,
                    self.graph
                        .neighbors_directed(index, Direction::Outgoing)
                        .count(),
                )
            })
            .collect();

        let mut layers = Vec::new();
        while !remaining.is_empty() {
            let mut ready: Vec<NodeIndex> = remaining
                .iter()
                .filter(|(_, pending)| **pending == 0)
                .map(|(index, _)| *index)
                .collect();

            if ready.is_empty() {
                return CycleSnafu {
                    edges: self.cycle_edges(&remaining),
                }
                .fail();
            }

            ready.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
            for index in &ready {
                remaining.remove(index);
                for dependent in self.graph.neighbors_directed(*index, Direction::Incoming) {
                    if let Some(pending) = remaining.get_mut(&dependent) {
                        *pending -= 1;
                    }
                }
            }
            layers.push(ready.iter().map(|index| self.graph[*index].clone()).collect());
        }

        Ok(layers)
    }

    /// The edges of every non-trivial strongly connected component among
    /// the still-unsorted vertices, ordered for stable error output.
    fn cycle_edges(&self, remaining: &HashMap<NodeIndex, usize>) -> Vec<(ObjMetadata, ObjMetadata)> {
        let mut edges = Vec::new();
        for component in petgraph::algo::tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&only| self.graph.contains_edge(only, only));
            if !cyclic || !component.iter().all(|index| remaining.contains_key(index)) {
                continue;
            }
            for &from in &component {
                for to in self.graph.neighbors_directed(from, Direction::Outgoing) {
                    if component.contains(&to) {
                        edges.push((self.graph[from].clone(), self.graph[to].clone()));
                    }
                }
            }
        }
        edges.sort();
        edges
    }
}

/// Maps the group/kind served by each CRD in the set to the CRD's identity.
fn crd_owners(
    objects: &HashMap<ObjMetadata, DynamicObject>,
) -> HashMap<GroupKind, ObjMetadata> {
    let mut owners = HashMap::new();
    for (id, object) in objects {
        if !id.is_crd() {
            continue;
        }
        let spec = object.data.get("spec");
        let group = spec
            .and_then(|spec| spec.get("group"))
            .and_then(|group| group.as_str());
        let kind = spec
            .and_then(|spec| spec.get("names"))
            .and_then(|names| names.get("kind"))
            .and_then(|kind| kind.as_str());
        if let (Some(group), Some(kind)) = (group, kind) {
            owners.insert(GroupKind::new(group, kind), id.clone());
        }
    }
    owners
}

#[cfg(test)]
mod tests;
