//! Honors the lifecycle annotations that veto pruning.

use kube::core::DynamicObject;
use snafu::ResultExt;

use crate::{
    annotations::{
        self, LIFECYCLE_DELETION_ANNOTATION, ON_REMOVE_ANNOTATION,
    },
    filter::{AnnotationSnafu, Filter, FilterContext, FilterError},
    object::ObjMetadata,
};

pub struct PreventRemoveFilter;

impl Filter for PreventRemoveFilter {
    fn name(&self) -> &'static str {
        "prevent-remove"
    }

    fn filter(
        &self,
        _id: &ObjMetadata,
        object: &DynamicObject,
        _context: &FilterContext<'_>,
    ) -> Result<(), FilterError> {
        if !annotations::removal_prevented(object).context(AnnotationSnafu)? {
            return Ok(());
        }

        // Report whichever annotation carried the veto.
        let stored = object.metadata.annotations.as_ref();
        let (key, value) = [LIFECYCLE_DELETION_ANNOTATION, ON_REMOVE_ANNOTATION]
            .into_iter()
            .find_map(|key| {
                stored
                    .and_then(|annotations| annotations.get(key))
                    .map(|value| (key, value.clone()))
            })
            .unwrap_or((LIFECYCLE_DELETION_ANNOTATION, String::new()));

        Err(FilterError::AnnotationPreventedDeletion {
            key: key.to_owned(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::filter::test_support::ContextFixture;

    fn pod(annotation: Option<(&str, &str)>) -> DynamicObject {
        let annotations = annotation
            .map(|(key, value)| {
                format!(
                    "
  annotations:
    {key}: {value}"
                )
            })
            .unwrap_or_default();
        serde_yaml::from_str(&format!(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-a
  namespace: test{annotations}
"
        ))
        .unwrap()
    }

    fn id() -> ObjMetadata {
        ObjMetadata::namespaced("", "Pod", "test", "pod-a")
    }

    #[rstest]
    #[case(ON_REMOVE_ANNOTATION, "keep")]
    #[case(LIFECYCLE_DELETION_ANNOTATION, "detach")]
    fn annotated_objects_are_kept(#[case] key: &'static str, #[case] value: &str) {
        let fixture = ContextFixture::default();
        let verdict =
            PreventRemoveFilter.filter(&id(), &pod(Some((key, value))), &fixture.context());
        assert_eq!(
            verdict,
            Err(FilterError::AnnotationPreventedDeletion {
                key: key.to_owned(),
                value: value.to_owned(),
            })
        );
        assert!(verdict.unwrap_err().abandons_object());
    }

    #[test]
    fn unannotated_objects_pass() {
        let fixture = ContextFixture::default();
        assert!(PreventRemoveFilter.filter(&id(), &pod(None), &fixture.context()).is_ok());
    }

    #[test]
    fn unknown_value_is_an_error() {
        let fixture = ContextFixture::default();
        let verdict = PreventRemoveFilter.filter(
            &id(),
            &pod(Some((ON_REMOVE_ANNOTATION, "retain"))),
            &fixture.context(),
        );
        assert!(matches!(verdict, Err(FilterError::Annotation { .. })));
    }
}
