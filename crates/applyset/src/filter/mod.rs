//! Actuation filters.
//!
//! Before the runner applies or prunes an object it runs the operation's
//! filter chain. The first filter that objects converts the actuation into
//! a skip, carrying a typed reason; later filters are not consulted.

use kube::core::DynamicObject;
use snafu::Snafu;

use crate::{
    annotations,
    graph::ObjectGraph,
    inventory::Inventory,
    object::{ObjMetadata, ObjMetadataSet},
};

mod dependency;
mod inventory_policy;
mod local_namespace;
mod prevent_mutation;
mod prevent_remove;
mod uid_mismatch;

pub use dependency::DependencyFilter;
pub use inventory_policy::InventoryPolicyFilter;
pub use local_namespace::LocalNamespaceFilter;
pub use prevent_mutation::PreventMutationFilter;
pub use prevent_remove::PreventRemoveFilter;
pub use uid_mismatch::UidMismatchFilter;

/// Why an actuation was skipped.
#[derive(Debug, PartialEq, Snafu)]
pub enum FilterError {
    #[snafu(display("object is owned by inventory {owner:?}"))]
    InventoryOverlap { owner: String },

    #[snafu(display("namespace {namespace:?} still contains objects of this apply set"))]
    NamespaceInUse { namespace: String },

    #[snafu(display("annotation {key}: {value} prevents deletion"))]
    AnnotationPreventedDeletion { key: String, value: String },

    #[snafu(display("annotation {key}: {value} prevents update"))]
    AnnotationPreventedUpdate { key: String, value: String },

    #[snafu(display(
        "dependency actuation mismatch: {dependency} is {actuation}",
        actuation = if *dependency_pruned { "being pruned" } else { "being applied" }
    ))]
    DependencyActuationMismatch {
        dependency: ObjMetadata,
        dependency_pruned: bool,
    },

    /// The live object is not the one the inventory recorded. This skip is
    /// silent: the entry is dropped on a later run instead.
    #[snafu(display("cluster UID {live:?} does not match recorded UID {recorded:?}"))]
    UidMismatch { recorded: String, live: String },

    #[snafu(display("lifecycle annotation is invalid"))]
    Annotation { source: annotations::Error },
}

impl FilterError {
    /// Silent skips produce a Skipped event without an error payload.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::UidMismatch { .. })
    }

    /// Whether the skipped prune should also detach the object from the
    /// inventory (dropping its entry and owner annotation).
    pub fn abandons_object(&self) -> bool {
        matches!(self, Self::AnnotationPreventedDeletion { .. })
    }
}

/// Everything a filter may consult about the run.
pub struct FilterContext<'a> {
    /// The object's current cluster state, if any.
    pub live: Option<&'a DynamicObject>,
    /// The inventory as loaded at the start of the run.
    pub inventory: &'a Inventory,
    /// Objects being applied this run.
    pub apply_ids: &'a ObjMetadataSet,
    /// Objects being pruned this run.
    pub prune_ids: &'a ObjMetadataSet,
    /// The run's dependency graph.
    pub graph: &'a ObjectGraph,
}

/// One predicate of a filter chain.
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(())` lets the actuation proceed, an error skips it.
    ///
    /// For applies, `object` is the desired manifest; for prunes it is the
    /// live object (identical to `context.live`).
    fn filter(
        &self,
        id: &ObjMetadata,
        object: &DynamicObject,
        context: &FilterContext<'_>,
    ) -> Result<(), FilterError>;
}

/// An ordered chain; evaluation short-circuits on the first verdict.
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    /// The chain consulted before every apply.
    pub fn for_apply(inventory_id: impl Into<String>, policy: crate::inventory::InventoryPolicy) -> Self {
        Self::new(vec![
            Box::new(InventoryPolicyFilter::new(inventory_id, policy)),
            Box::new(DependencyFilter::for_apply()),
            Box::new(PreventMutationFilter),
        ])
    }

    /// The chain consulted before every prune or destroy deletion.
    pub fn for_prune() -> Self {
        Self::new(vec![
            Box::new(LocalNamespaceFilter),
            Box::new(PreventRemoveFilter),
            Box::new(DependencyFilter::for_prune()),
            Box::new(UidMismatchFilter),
        ])
    }

    pub fn evaluate(
        &self,
        id: &ObjMetadata,
        object: &DynamicObject,
        context: &FilterContext<'_>,
    ) -> Result<(), FilterError> {
        for filter in &self.filters {
            filter.filter(id, object, context)?;
        }
        Ok(())
    }
}
