//! Apply-time mutation.
//!
//! Just before an object carrying the `apply-time-mutation` annotation is
//! applied, each of its field substitutions reads the live state of its
//! source object and writes the result into the target path. The graph
//! guarantees the source was applied and reconciled in an earlier layer.

use std::sync::Arc;

use kube::core::DynamicObject;
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

use crate::{
    annotations::{ApplyTimeMutation, mutation},
    client::{self, ClusterClient},
    object::{self, FieldPath, ObjMetadata, path},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid apply-time-mutation annotation"))]
    Annotation { source: mutation::Error },

    #[snafu(display("invalid field path in apply-time-mutation entry"))]
    Path { source: path::Error },

    #[snafu(display("failed to read mutation source {id}"))]
    SourceGet { source: client::Error, id: ObjMetadata },

    #[snafu(display("mutation source {id} does not exist"))]
    SourceNotFound { id: ObjMetadata },

    #[snafu(display("field {field_path} not found on mutation source {id}"))]
    FieldNotFound { id: ObjMetadata, field_path: String },

    #[snafu(display(
        "target {field_path} must be a string to substitute token {token:?}"
    ))]
    TypeMismatch { field_path: String, token: String },
}

/// Resolves and applies the substitutions of one object.
pub struct ApplyTimeMutator {
    client: Arc<dyn ClusterClient>,
}

impl ApplyTimeMutator {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Substitutes all annotated fields in place.
    ///
    /// Returns `true` when any substitution was made. The caller passes a
    /// clone; the original desired object is never touched.
    pub async fn mutate(&self, object: &mut DynamicObject) -> Result<bool, Error> {
        let mutation = ApplyTimeMutation::from_object(object).context(AnnotationSnafu)?;
        if mutation.is_empty() {
            return Ok(false);
        }

        let id = ObjMetadata::from_object(object).ok();
        let default_namespace = id.as_ref().map(|id| id.namespace.as_str()).unwrap_or("");

        for substitution in &mutation.0 {
            let source_id = substitution.source_ref.to_id(default_namespace);
            let source_path = substitution.source_path().context(PathSnafu)?;
            let target_path = substitution.target_path().context(PathSnafu)?;

            let source_object = self
                .client
                .get(&source_id)
                .await
                .context(SourceGetSnafu {
                    id: source_id.clone(),
                })?
                .context(SourceNotFoundSnafu {
                    id: source_id.clone(),
                })?;

            let source_value =
                object::path::lookup(&source_object, &source_path).context(FieldNotFoundSnafu {
                    id: source_id.clone(),
                    field_path: source_path.to_string(),
                })?;

            debug!(
                source = %source_id,
                source_path = %source_path,
                target_path = %target_path,
                "substituting apply-time-mutation field"
            );
            substitute(object, &target_path, source_value, substitution.token.as_deref())?;
        }

        Ok(true)
    }
}

fn substitute(
    object: &mut DynamicObject,
    target_path: &FieldPath,
    source_value: Value,
    token: Option<&str>,
) -> Result<(), Error> {
    let current = object::path::lookup(object, target_path);

    let new_value = match token {
        Some(token) => {
            // Token substitution composes into an existing string value.
            let current = current.unwrap_or(Value::String(String::new()));
            let target = current.as_str().context(TypeMismatchSnafu {
                field_path: target_path.to_string(),
                token,
            })?;
            Value::String(target.replace(token, &stringify(&source_value)))
        }
        None => match current {
            // A string target keeps being a string; non-string sources are
            // JSON-encoded into it.
            Some(Value::String(_)) if !source_value.is_string() => {
                Value::String(stringify(&source_value))
            }
            _ => source_value,
        },
    };

    if !object::path::set(object, target_path, new_value) {
        return TypeMismatchSnafu {
            field_path: target_path.to_string(),
            token: token.unwrap_or_default(),
        }
        .fail();
    }
    Ok(())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(value) => value.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClusterClient;

    fn mutator_with_source(source: &str) -> ApplyTimeMutator {
        let client = Arc::new(FakeClusterClient::default());
        client.put_object(serde_yaml::from_str(source).unwrap());
        ApplyTimeMutator::new(client)
    }

    fn target(token_line: &str) -> DynamicObject {
        serde_yaml::from_str(&format!(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-a
  namespace: test
  annotations:
    config.kubernetes.io/apply-time-mutation: |
      - sourceRef:
          kind: Pod
          name: pod-b
        sourcePath: $.status.podIP
        targetPath: $.spec.containers[0].env[0].value
{token_line}
spec:
  containers:
  - name: main
    env:
    - name: PEER_IP
      value: '${{ip}}:8080'
",
        ))
        .unwrap()
    }

    const SOURCE: &str = "
apiVersion: v1
kind: Pod
metadata:
  name: pod-b
  namespace: test
status:
  podIP: 10.0.0.7
";

    #[tokio::test]
    async fn token_substitution_composes_strings() {
        let mutator = mutator_with_source(SOURCE);
        let mut object = target("        token: ${ip}");

        assert!(mutator.mutate(&mut object).await.unwrap());

        let path = "spec.containers[0].env[0].value".parse().unwrap();
        assert_eq!(
            object::path::lookup(&object, &path),
            Some(Value::String("10.0.0.7:8080".to_owned()))
        );
    }

    #[tokio::test]
    async fn wholesale_substitution_replaces_value() {
        let mutator = mutator_with_source(SOURCE);
        let mut object = target("");

        assert!(mutator.mutate(&mut object).await.unwrap());

        let path = "spec.containers[0].env[0].value".parse().unwrap();
        assert_eq!(
            object::path::lookup(&object, &path),
            Some(Value::String("10.0.0.7".to_owned()))
        );
    }

    #[tokio::test]
    async fn missing_source_field_fails() {
        let mutator = mutator_with_source(
            "
apiVersion: v1
kind: Pod
metadata:
  name: pod-b
  namespace: test
",
        );
        let mut object = target("        token: ${ip}");

        assert!(matches!(
            mutator.mutate(&mut object).await,
            Err(Error::FieldNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_source_object_fails() {
        let mutator = ApplyTimeMutator::new(Arc::new(FakeClusterClient::default()));
        let mut object = target("        token: ${ip}");

        assert!(matches!(
            mutator.mutate(&mut object).await,
            Err(Error::SourceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unannotated_object_is_untouched() {
        let mutator = ApplyTimeMutator::new(Arc::new(FakeClusterClient::default()));
        let mut object: DynamicObject = serde_yaml::from_str(
            "
apiVersion: v1
kind: Pod
metadata:
  name: plain
  namespace: test
",
        )
        .unwrap();
        let before = object.clone();

        assert!(!mutator.mutate(&mut object).await.unwrap());
        assert_eq!(object, before);
    }
}
