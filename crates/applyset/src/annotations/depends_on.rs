//! Parsing of the `config.kubernetes.io/depends-on` annotation.
//!
//! The value is a comma-separated list of object references:
//!
//! ```text
//! <group>/namespaces/<namespace>/<kind>/<name>   namespaced
//! <group>/<kind>/<name>                          cluster-scoped
//! ```
//!
//! The group segment is empty for the core group, giving references a
//! leading slash such as `/namespaces/default/Pod/pod-a`.

use std::{fmt, str::FromStr};

use kube::core::DynamicObject;
use snafu::Snafu;

use crate::{
    annotations::{DEPENDS_ON_ANNOTATION, annotation},
    object::{GroupKind, ObjMetadata},
};

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display(
        "dependency reference {reference:?} must have the form \
         <group>/namespaces/<namespace>/<kind>/<name> or <group>/<kind>/<name>"
    ))]
    MalformedReference { reference: String },

    #[snafu(display("dependency reference {reference:?} has an empty {segment} segment"))]
    EmptySegment {
        reference: String,
        segment: &'static str,
    },
}

/// The parsed dependency list of one object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependsOn(pub Vec<ObjMetadata>);

impl DependsOn {
    /// Parses the annotation off an object. Absence yields an empty list.
    pub fn from_object(object: &DynamicObject) -> Result<Self, Error> {
        match annotation(object, DEPENDS_ON_ANNOTATION) {
            Some(value) => value.parse(),
            None => Ok(Self::default()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjMetadata> {
        self.0.iter()
    }
}

impl FromStr for DependsOn {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .split(',')
            .map(str::trim)
            .filter(|reference| !reference.is_empty())
            .map(parse_reference)
            .collect::<Result<Vec<_>, _>>()
            .map(DependsOn)
    }
}

impl fmt::Display for DependsOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", format_reference(id))?;
        }
        Ok(())
    }
}

fn parse_reference(reference: &str) -> Result<ObjMetadata, Error> {
    let segments: Vec<&str> = reference.split('/').collect();

    let (group, namespace, kind, name) = match segments.as_slice() {
        [group, marker, namespace, kind, name] if *marker == "namespaces" => {
            (*group, *namespace, *kind, *name)
        }
        [group, kind, name] => (*group, "", *kind, *name),
        _ => return MalformedReferenceSnafu { reference }.fail(),
    };

    for (segment, label) in [(kind, "kind"), (name, "name")] {
        if segment.is_empty() {
            return EmptySegmentSnafu {
                reference,
                segment: label,
            }
            .fail();
        }
    }
    if segments.len() == 5 && namespace.is_empty() {
        return EmptySegmentSnafu {
            reference,
            segment: "namespace",
        }
        .fail();
    }

    Ok(ObjMetadata::new(
        GroupKind::new(group, kind),
        namespace,
        name,
    ))
}

fn format_reference(id: &ObjMetadata) -> String {
    if id.namespace.is_empty() {
        format!("{}/{}/{}", id.group_kind.group, id.group_kind.kind, id.name)
    } else {
        format!(
            "{}/namespaces/{}/{}/{}",
            id.group_kind.group, id.namespace, id.group_kind.kind, id.name
        )
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn parses_namespaced_core_reference() {
        let parsed: DependsOn = "/namespaces/default/Pod/pod-a".parse().unwrap();
        assert_eq!(
            parsed.0,
            vec![ObjMetadata::namespaced("", "Pod", "default", "pod-a")]
        );
    }

    #[test]
    fn parses_cluster_scoped_group_reference() {
        let parsed: DependsOn = "rbac.authorization.k8s.io/ClusterRole/admin".parse().unwrap();
        assert_eq!(
            parsed.0,
            vec![ObjMetadata::cluster_scoped(
                "rbac.authorization.k8s.io",
                "ClusterRole",
                "admin"
            )]
        );
    }

    #[test]
    fn parses_multiple_references() {
        let parsed: DependsOn =
            "/namespaces/default/Pod/pod-a, apps/namespaces/default/Deployment/web"
                .parse()
                .unwrap();
        assert_eq!(parsed.0.len(), 2);
        assert_eq!(parsed.0[1].group_kind.group, "apps");
    }

    #[rstest]
    #[case("Pod/pod-a/too/many/segments/here")]
    #[case("/namespaces//Pod/pod-a")]
    #[case("//pod-a")]
    #[case("/namespaces/default/Pod/")]
    #[case("just-a-name")]
    fn rejects_malformed_references(#[case] reference: &str) {
        assert!(DependsOn::from_str(reference).is_err());
    }

    #[test]
    fn display_round_trips() {
        let value = "/namespaces/default/Pod/pod-a,apps/namespaces/default/Deployment/web";
        let parsed: DependsOn = value.parse().unwrap();
        assert_eq!(parsed.to_string(), value);
    }

    #[test]
    fn absent_annotation_is_empty() {
        let pod: DynamicObject = serde_yaml::from_str(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-a
",
        )
        .unwrap();
        assert!(DependsOn::from_object(&pod).unwrap().is_empty());
    }
}
