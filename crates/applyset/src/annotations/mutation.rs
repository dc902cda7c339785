//! Parsing of the `config.kubernetes.io/apply-time-mutation` annotation.
//!
//! The value is a YAML list of field substitutions. Each entry names a source
//! object, a path to read from it after it has reconciled, and a path in the
//! annotated object to write to. An optional token limits the substitution to
//! a marker substring inside the target value.

use std::str::FromStr;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    annotations::{MUTATION_ANNOTATION, annotation},
    object::{FieldPath, GroupKind, ObjMetadata, path},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse apply-time-mutation annotation"))]
    ParseAnnotation { source: serde_yaml::Error },

    #[snafu(display("invalid {which} path in apply-time-mutation entry {index}"))]
    InvalidPath {
        source: path::Error,
        which: &'static str,
        index: usize,
    },

    #[snafu(display("apply-time-mutation entry {index} has an empty source kind or name"))]
    IncompleteSourceRef { index: usize },
}

/// A reference to the object a substitution reads from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceReference {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl SourceReference {
    /// The identity of the source, defaulting the namespace to that of the
    /// annotated object for namespaced references.
    pub fn to_id(&self, default_namespace: &str) -> ObjMetadata {
        let namespace = if self.namespace.is_empty() {
            default_namespace
        } else {
            &self.namespace
        };
        ObjMetadata::new(
            GroupKind::new(self.group.clone(), self.kind.clone()),
            namespace,
            self.name.clone(),
        )
    }
}

/// One field substitution of an apply-time mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldSubstitution {
    pub source_ref: SourceReference,
    pub source_path: String,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl FieldSubstitution {
    pub fn source_path(&self) -> Result<FieldPath, path::Error> {
        FieldPath::from_str(&self.source_path)
    }

    pub fn target_path(&self) -> Result<FieldPath, path::Error> {
        FieldPath::from_str(&self.target_path)
    }
}

/// The parsed apply-time mutation of one object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyTimeMutation(pub Vec<FieldSubstitution>);

impl ApplyTimeMutation {
    /// Parses the annotation off an object, validating that every entry has
    /// a complete source reference and syntactically valid paths. Absence
    /// yields an empty mutation.
    pub fn from_object(object: &DynamicObject) -> Result<Self, Error> {
        let Some(value) = annotation(object, MUTATION_ANNOTATION) else {
            return Ok(Self::default());
        };

        let substitutions: Vec<FieldSubstitution> =
            serde_yaml::from_str(value).context(ParseAnnotationSnafu)?;

        for (index, substitution) in substitutions.iter().enumerate() {
            if substitution.source_ref.kind.is_empty() || substitution.source_ref.name.is_empty() {
                return IncompleteSourceRefSnafu { index }.fail();
            }
            substitution
                .source_path()
                .context(InvalidPathSnafu { which: "source", index })?;
            substitution
                .target_path()
                .context(InvalidPathSnafu { which: "target", index })?;
        }

        Ok(Self(substitutions))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The identities of all source objects, deduplicated in entry order.
    pub fn source_ids(&self, default_namespace: &str) -> Vec<ObjMetadata> {
        let mut ids = Vec::new();
        for substitution in &self.0 {
            let id = substitution.source_ref.to_id(default_namespace);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}
