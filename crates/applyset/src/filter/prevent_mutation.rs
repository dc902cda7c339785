//! Honors the lifecycle annotation that freezes an object after creation.

use kube::core::DynamicObject;
use snafu::ResultExt;

use crate::{
    annotations::{self, LIFECYCLE_MUTATION_ANNOTATION},
    filter::{AnnotationSnafu, Filter, FilterContext, FilterError},
    object::ObjMetadata,
};

pub struct PreventMutationFilter;

impl Filter for PreventMutationFilter {
    fn name(&self) -> &'static str {
        "prevent-mutation"
    }

    fn filter(
        &self,
        _id: &ObjMetadata,
        object: &DynamicObject,
        context: &FilterContext<'_>,
    ) -> Result<(), FilterError> {
        // Creation is always allowed; only updates are suppressed.
        if context.live.is_none() {
            return Ok(());
        }

        if annotations::mutation_ignored(object).context(AnnotationSnafu)? {
            return Err(FilterError::AnnotationPreventedUpdate {
                key: LIFECYCLE_MUTATION_ANNOTATION.to_owned(),
                value: "ignore".to_owned(),
            });
        }
        Ok(())
    }
}
