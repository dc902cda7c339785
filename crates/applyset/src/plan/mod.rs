//! Task planning.
//!
//! The planner turns topological layers into the ordered list of task
//! groups the runner executes. Apply layers run in dependency order, prune
//! layers in reverse dependency order, and the inventory bookkeeping
//! groups bracket the whole run.

use strum::Display;

use crate::{
    event::ActionGroupSummary,
    object::{ObjMetadata, ObjMetadataSet},
    poll::WaitGoal,
};

/// What a task group does.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "kebab-case")]
pub enum Action {
    InventoryAdd,
    Apply,
    Wait,
    Prune,
    Delete,
    InventorySet,
    InventoryDelete,
}

/// One group of the plan. Objects within a group have no dependency edges
/// between each other and may be actuated concurrently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskGroup {
    pub action: Action,
    pub name: String,
    pub objects: Vec<ObjMetadata>,
    /// Set on `Wait` groups only.
    pub wait_goal: Option<WaitGoal>,
}

impl TaskGroup {
    fn new(action: Action, index: usize, objects: Vec<ObjMetadata>) -> Self {
        Self {
            name: format!("{action}-{index}"),
            action,
            objects,
            wait_goal: None,
        }
    }

    fn wait(index: usize, objects: Vec<ObjMetadata>, goal: WaitGoal) -> Self {
        Self {
            wait_goal: Some(goal),
            ..Self::new(Action::Wait, index, objects)
        }
    }
}

/// The ordered groups of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskPlan {
    pub groups: Vec<TaskGroup>,
}

impl TaskPlan {
    /// The group list in event form, announced by the run's init event.
    pub fn summaries(&self) -> Vec<ActionGroupSummary> {
        self.groups
            .iter()
            .map(|group| ActionGroupSummary {
                name: group.name.clone(),
                action: group.action,
                identifiers: group.objects.clone(),
            })
            .collect()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|group| group.name.clone()).collect()
    }
}

/// Builds the plan for an apply run.
///
/// `layers` is the full topological layering over desired and prune
/// vertices combined; each layer is filtered down to the respective set so
/// apply groups run in dependency order and prune groups in reverse.
/// Dry runs actuate but never wait.
pub fn build_apply_plan(
    layers: &[Vec<ObjMetadata>],
    desired: &ObjMetadataSet,
    prune: &ObjMetadataSet,
    dry_run: bool,
) -> TaskPlan {
    let mut groups = Vec::new();
    let mut wait_index = 0;

    groups.push(TaskGroup::new(
        Action::InventoryAdd,
        0,
        desired.iter().cloned().collect(),
    ));

    for (index, layer) in filter_layers(layers, desired).into_iter().enumerate() {
        groups.push(TaskGroup::new(Action::Apply, index, layer.clone()));
        if !dry_run {
            groups.push(TaskGroup::wait(wait_index, layer, WaitGoal::Current));
            wait_index += 1;
        }
    }

    let mut prune_layers = filter_layers(layers, prune);
    prune_layers.reverse();
    for (index, layer) in prune_layers.into_iter().enumerate() {
        groups.push(TaskGroup::new(Action::Prune, index, layer.clone()));
        if !dry_run {
            groups.push(TaskGroup::wait(wait_index, layer, WaitGoal::NotFound));
            wait_index += 1;
        }
    }

    groups.push(TaskGroup::new(Action::InventorySet, 0, Vec::new()));

    TaskPlan { groups }
}

/// Builds the plan for a destroy run: every inventory object is deleted in
/// reverse dependency order and the record itself goes last.
pub fn build_destroy_plan(
    layers: &[Vec<ObjMetadata>],
    targets: &ObjMetadataSet,
    dry_run: bool,
) -> TaskPlan {
    let mut groups = Vec::new();
    let mut wait_index = 0;

    let mut delete_layers = filter_layers(layers, targets);
    delete_layers.reverse();
    for (index, layer) in delete_layers.into_iter().enumerate() {
        groups.push(TaskGroup::new(Action::Delete, index, layer.clone()));
        if !dry_run {
            groups.push(TaskGroup::wait(wait_index, layer, WaitGoal::NotFound));
            wait_index += 1;
        }
    }

    groups.push(TaskGroup::new(Action::InventoryDelete, 0, Vec::new()));

    TaskPlan { groups }
}

fn filter_layers(layers: &[Vec<ObjMetadata>], keep: &ObjMetadataSet) -> Vec<Vec<ObjMetadata>> {
    layers
        .iter()
        .map(|layer| {
            layer
                .iter()
                .filter(|id| keep.contains(id))
                .cloned()
                .collect::<Vec<_>>()
        })
        .filter(|layer| !layer.is_empty())
        .collect()
}
