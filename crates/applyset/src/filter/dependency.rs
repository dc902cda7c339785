//! Skips actuations whose graph neighbors are actuated the other way.
//!
//! Applying an object whose dependency is about to be pruned would leave it
//! pointing at nothing; pruning an object that something still applied
//! depends on would break that dependent. Both sides of such an edge are
//! skipped, leaving the cluster and the inventory unchanged.

use kube::core::DynamicObject;

use crate::{
    filter::{Filter, FilterContext, FilterError},
    inventory::Strategy,
    object::ObjMetadata,
};

pub struct DependencyFilter {
    strategy: Strategy,
}

impl DependencyFilter {
    pub fn for_apply() -> Self {
        Self {
            strategy: Strategy::Apply,
        }
    }

    pub fn for_prune() -> Self {
        Self {
            strategy: Strategy::Delete,
        }
    }
}

impl Filter for DependencyFilter {
    fn name(&self) -> &'static str {
        "dependency"
    }

    fn filter(
        &self,
        id: &ObjMetadata,
        _object: &DynamicObject,
        context: &FilterContext<'_>,
    ) -> Result<(), FilterError> {
        match self.strategy {
            Strategy::Apply => {
                for dependency in context.graph.dependencies_of(id) {
                    if context.prune_ids.contains(&dependency) {
                        return Err(FilterError::DependencyActuationMismatch {
                            dependency,
                            dependency_pruned: true,
                        });
                    }
                }
            }
            Strategy::Delete => {
                for dependent in context.graph.dependents_of(id) {
                    if context.apply_ids.contains(&dependent) {
                        return Err(FilterError::DependencyActuationMismatch {
                            dependency: dependent,
                            dependency_pruned: false,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
