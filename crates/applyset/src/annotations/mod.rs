//! The annotation vocabulary understood by the engine.
//!
//! All values are case-sensitive. A recognized key with an unknown value is
//! a validation failure, never a silent default.

use kube::core::DynamicObject;
use snafu::Snafu;

pub mod depends_on;
pub mod mutation;

pub use depends_on::DependsOn;
pub use mutation::{ApplyTimeMutation, FieldSubstitution, SourceReference};

/// Declares ordering dependencies on other objects in the set.
pub const DEPENDS_ON_ANNOTATION: &str = "config.kubernetes.io/depends-on";

/// Declares field substitutions resolved from applied objects.
pub const MUTATION_ANNOTATION: &str = "config.kubernetes.io/apply-time-mutation";

/// Lifecycle: how the object leaves management when pruned.
pub const LIFECYCLE_DELETION_ANNOTATION: &str = "client.lifecycle.config.k8s.io/deletion";

/// Lifecycle: whether updates after the first apply are suppressed.
pub const LIFECYCLE_MUTATION_ANNOTATION: &str = "client.lifecycle.config.k8s.io/mutation";

/// Legacy prune-prevention marker.
pub const ON_REMOVE_ANNOTATION: &str = "cli-utils.sigs.k8s.io/on-remove";

/// Records which inventory owns an applied object.
pub const OWNING_INVENTORY_ANNOTATION: &str = "config.k8s.io/owning-inventory";

const DELETION_DETACH: &str = "detach";
const MUTATION_IGNORE: &str = "ignore";
const ON_REMOVE_KEEP: &str = "keep";

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("unknown value {value:?} for annotation {key:?}"))]
    UnknownValue { key: &'static str, value: String },
}

fn annotation<'a>(object: &'a DynamicObject, key: &str) -> Option<&'a str> {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

fn known_value(object: &DynamicObject, key: &'static str, known: &str) -> Result<bool, Error> {
    match annotation(object, key) {
        None => Ok(false),
        Some(value) if value == known => Ok(true),
        Some(value) => UnknownValueSnafu { key, value }.fail(),
    }
}

/// Whether pruning this object must detach it instead of deleting it.
///
/// Both the lifecycle `deletion: detach` annotation and the legacy
/// `on-remove: keep` marker prevent removal.
pub fn removal_prevented(object: &DynamicObject) -> Result<bool, Error> {
    let detach = known_value(object, LIFECYCLE_DELETION_ANNOTATION, DELETION_DETACH)?;
    let keep = known_value(object, ON_REMOVE_ANNOTATION, ON_REMOVE_KEEP)?;
    Ok(detach || keep)
}

/// Whether updates to an already existing object are suppressed.
pub fn mutation_ignored(object: &DynamicObject) -> Result<bool, Error> {
    known_value(object, LIFECYCLE_MUTATION_ANNOTATION, MUTATION_IGNORE)
}

/// The unique ID of the inventory owning this object, if recorded.
pub fn owning_inventory(object: &DynamicObject) -> Option<&str> {
    annotation(object, OWNING_INVENTORY_ANNOTATION).filter(|value| !value.is_empty())
}

/// Stamps the owning-inventory annotation onto an object.
pub fn set_owning_inventory(object: &mut DynamicObject, inventory_id: &str) {
    object
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(OWNING_INVENTORY_ANNOTATION.to_owned(), inventory_id.to_owned());
}

/// Removes the owning-inventory annotation, detaching the object.
pub fn clear_owning_inventory(object: &mut DynamicObject) {
    if let Some(annotations) = object.metadata.annotations.as_mut() {
        annotations.remove(OWNING_INVENTORY_ANNOTATION);
    }
}
