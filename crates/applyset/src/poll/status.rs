//! Readiness rules for polled objects.
//!
//! A trimmed-down status computation in the spirit of kstatus: well-known
//! workload kinds get dedicated rules, everything else falls back to the
//! `Ready`/`Available` conditions and finally to plain existence.

use kube::core::DynamicObject;
use serde_json::Value;

use crate::poll::StatusPhase;

/// Derives the phase of a live object.
pub fn compute(object: &DynamicObject) -> (StatusPhase, String) {
    if object.metadata.deletion_timestamp.is_some() {
        return (StatusPhase::Terminating, "deletion in progress".to_owned());
    }

    let status = object.data.get("status");

    // A controller that has not observed the latest spec yet cannot be
    // current, regardless of what the stale status claims.
    if let (Some(observed), Some(generation)) = (
        status
            .and_then(|status| status.get("observedGeneration"))
            .and_then(Value::as_i64),
        object.metadata.generation,
    ) && observed < generation
    {
        return (
            StatusPhase::InProgress,
            format!("observed generation {observed} behind {generation}"),
        );
    }

    let kind = object
        .types
        .as_ref()
        .map(|types| types.kind.as_str())
        .unwrap_or_default();

    match kind {
        "Pod" => pod_status(object, status),
        "Deployment" => deployment_status(object, status),
        "StatefulSet" => replicated_status(object, status, "readyReplicas"),
        "ReplicaSet" => replicated_status(object, status, "availableReplicas"),
        "Job" => job_status(status),
        "Namespace" => match phase_field(status) {
            Some("Active") | None => (StatusPhase::Current, String::new()),
            Some(phase) => (StatusPhase::InProgress, format!("phase {phase}")),
        },
        "CustomResourceDefinition" => condition_status(status, "Established"),
        _ => generic_status(status),
    }
}

fn phase_field(status: Option<&Value>) -> Option<&str> {
    status
        .and_then(|status| status.get("phase"))
        .and_then(Value::as_str)
}

fn condition<'a>(status: Option<&'a Value>, wanted: &str) -> Option<&'a Value> {
    status
        .and_then(|status| status.get("conditions"))
        .and_then(Value::as_array)
        .and_then(|conditions| {
            conditions.iter().find(|condition| {
                condition.get("type").and_then(Value::as_str) == Some(wanted)
            })
        })
}

fn condition_is_true(status: Option<&Value>, wanted: &str) -> Option<bool> {
    condition(status, wanted)
        .and_then(|condition| condition.get("status"))
        .and_then(Value::as_str)
        .map(|value| value == "True")
}

fn pod_status(object: &DynamicObject, status: Option<&Value>) -> (StatusPhase, String) {
    match phase_field(status) {
        Some("Succeeded") => (StatusPhase::Current, "pod completed".to_owned()),
        Some("Failed") => (StatusPhase::Failed, "pod failed".to_owned()),
        Some("Running") => {
            if condition_is_true(status, "Ready") == Some(true) {
                (StatusPhase::Current, "pod ready".to_owned())
            } else {
                (StatusPhase::InProgress, "pod running, not ready".to_owned())
            }
        }
        // Pods applied against fakes or freshly created often have no
        // status at all yet; absence of a phase counts as existence.
        None if object.data.get("status").is_none() => (StatusPhase::Current, String::new()),
        phase => (
            StatusPhase::InProgress,
            format!("pod phase {}", phase.unwrap_or("unset")),
        ),
    }
}

fn deployment_status(object: &DynamicObject, status: Option<&Value>) -> (StatusPhase, String) {
    if let Some(condition) = condition(status, "Progressing")
        && condition.get("reason").and_then(Value::as_str) == Some("ProgressDeadlineExceeded")
    {
        return (StatusPhase::Failed, "progress deadline exceeded".to_owned());
    }
    replicated_status(object, status, "availableReplicas")
}

fn replicated_status(
    object: &DynamicObject,
    status: Option<&Value>,
    ready_field: &str,
) -> (StatusPhase, String) {
    let desired = object
        .data
        .get("spec")
        .and_then(|spec| spec.get("replicas"))
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready = status
        .and_then(|status| status.get(ready_field))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    if ready >= desired {
        (StatusPhase::Current, format!("{ready}/{desired} replicas ready"))
    } else {
        (
            StatusPhase::InProgress,
            format!("{ready}/{desired} replicas ready"),
        )
    }
}

fn job_status(status: Option<&Value>) -> (StatusPhase, String) {
    if condition_is_true(status, "Failed") == Some(true) {
        return (StatusPhase::Failed, "job failed".to_owned());
    }
    if condition_is_true(status, "Complete") == Some(true) {
        return (StatusPhase::Current, "job complete".to_owned());
    }
    (StatusPhase::InProgress, "job running".to_owned())
}

fn condition_status(status: Option<&Value>, wanted: &str) -> (StatusPhase, String) {
    match condition_is_true(status, wanted) {
        Some(true) => (StatusPhase::Current, format!("{wanted} condition met")),
        Some(false) => (StatusPhase::InProgress, format!("{wanted} condition false")),
        None => (StatusPhase::InProgress, format!("no {wanted} condition")),
    }
}

fn generic_status(status: Option<&Value>) -> (StatusPhase, String) {
    for wanted in ["Ready", "Available"] {
        match condition_is_true(status, wanted) {
            Some(true) => return (StatusPhase::Current, format!("{wanted} condition met")),
            Some(false) => {
                return (StatusPhase::InProgress, format!("{wanted} condition false"));
            }
            None => {}
        }
    }
    // Kinds without a readiness contract are current once they exist.
    (StatusPhase::Current, String::new())
}
