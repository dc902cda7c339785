//! Refuses to prune an object the inventory did not create.
//!
//! When an object was deleted and recreated out-of-band its UID no longer
//! matches the recorded one. Deleting it would destroy someone else's
//! object, so the prune is skipped silently; the stale entry falls out of
//! the inventory on a later run.

use kube::core::DynamicObject;

use crate::{
    filter::{Filter, FilterContext, FilterError},
    object::ObjMetadata,
};

pub struct UidMismatchFilter;

impl Filter for UidMismatchFilter {
    fn name(&self) -> &'static str {
        "uid-mismatch"
    }

    fn filter(
        &self,
        id: &ObjMetadata,
        _object: &DynamicObject,
        context: &FilterContext<'_>,
    ) -> Result<(), FilterError> {
        let Some(recorded) = context.inventory.uid_of(id) else {
            return Ok(());
        };
        let Some(live) = context
            .live
            .and_then(|live| live.metadata.uid.as_deref())
            .filter(|uid| !uid.is_empty())
        else {
            return Ok(());
        };

        if live != recorded {
            return Err(FilterError::UidMismatch {
                recorded: recorded.to_owned(),
                live: live.to_owned(),
            });
        }
        Ok(())
    }
}
