//! Keeps a Namespace alive while this apply set still populates it.

use kube::core::DynamicObject;

use crate::{
    filter::{Filter, FilterContext, FilterError},
    object::ObjMetadata,
};

pub struct LocalNamespaceFilter;

impl Filter for LocalNamespaceFilter {
    fn name(&self) -> &'static str {
        "local-namespace"
    }

    fn filter(
        &self,
        id: &ObjMetadata,
        _object: &DynamicObject,
        context: &FilterContext<'_>,
    ) -> Result<(), FilterError> {
        if !id.is_namespace() {
            return Ok(());
        }

        if context
            .apply_ids
            .iter()
            .any(|applied| applied.namespace == id.name)
        {
            return Err(FilterError::NamespaceInUse {
                namespace: id.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::ContextFixture;

    fn namespace_object(name: &str) -> DynamicObject {
        serde_yaml::from_str(&format!(
            "
apiVersion: v1
kind: Namespace
metadata:
  name: {name}
"
        ))
        .unwrap()
    }

    #[test]
    fn namespace_with_local_objects_is_kept() {
        let mut fixture = ContextFixture::default();
        fixture.apply_ids = [ObjMetadata::namespaced("", "Pod", "apps", "pod-a")]
            .into_iter()
            .collect();

        let id = ObjMetadata::cluster_scoped("", "Namespace", "apps");
        let verdict =
            LocalNamespaceFilter.filter(&id, &namespace_object("apps"), &fixture.context());
        assert_eq!(
            verdict,
            Err(FilterError::NamespaceInUse {
                namespace: "apps".to_owned()
            })
        );
    }

    #[test]
    fn unrelated_namespace_passes() {
        let mut fixture = ContextFixture::default();
        fixture.apply_ids = [ObjMetadata::namespaced("", "Pod", "other", "pod-a")]
            .into_iter()
            .collect();

        let id = ObjMetadata::cluster_scoped("", "Namespace", "apps");
        assert!(
            LocalNamespaceFilter
                .filter(&id, &namespace_object("apps"), &fixture.context())
                .is_ok()
        );
    }

    #[test]
    fn non_namespace_kinds_pass() {
        let fixture = ContextFixture::default();
        let id = ObjMetadata::namespaced("", "Pod", "apps", "pod-a");
        let object: DynamicObject = serde_yaml::from_str(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-a
  namespace: apps
",
        )
        .unwrap();
        assert!(LocalNamespaceFilter.filter(&id, &object, &fixture.context()).is_ok());
    }
}
