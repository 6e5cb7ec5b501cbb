//! Readiness validation for live objects, used by hook waits and
//! `waitReadiness` items. Per-kind rules where the kind has meaningful
//! status, a generic condition walk otherwise.

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub ready: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn ready() -> Self {
        Self { ready: true, errors: Vec::new() }
    }

    fn pending() -> Self {
        Self { ready: false, errors: Vec::new() }
    }

    fn failed(msg: impl Into<String>) -> Self {
        Self { ready: false, errors: vec![msg.into()] }
    }
}

/// Decide whether a live object is ready per its kind's rules.
/// Objects without status (ConfigMaps, Secrets, ...) are ready as applied.
pub fn validate_object(obj: &Value) -> ValidationResult {
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    let status = match obj.get("status") {
        Some(s) if s.is_object() && !s.as_object().unwrap().is_empty() => s,
        _ => return ValidationResult::ready(),
    };

    match kind {
        "Job" => validate_job(status),
        "Pod" => validate_pod(status),
        "Deployment" => validate_replicas(obj, status, "readyReplicas"),
        "StatefulSet" => validate_replicas(obj, status, "readyReplicas"),
        "ReplicaSet" => validate_replicas(obj, status, "readyReplicas"),
        "DaemonSet" => validate_daemonset(status),
        _ => validate_conditions(status),
    }
}

fn condition<'a>(status: &'a Value, type_: &str) -> Option<&'a Value> {
    status
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))
}

fn condition_true(status: &Value, type_: &str) -> bool {
    condition(status, type_)
        .and_then(|c| c.get("status"))
        .and_then(|s| s.as_str())
        == Some("True")
}

fn condition_message(status: &Value, type_: &str) -> String {
    condition(status, type_)
        .and_then(|c| c.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("no message")
        .to_string()
}

fn validate_job(status: &Value) -> ValidationResult {
    if condition_true(status, "Complete") {
        return ValidationResult::ready();
    }
    if condition_true(status, "Failed") {
        return ValidationResult::failed(format!("job failed: {}", condition_message(status, "Failed")));
    }
    ValidationResult::pending()
}

fn validate_pod(status: &Value) -> ValidationResult {
    match status.get("phase").and_then(|p| p.as_str()) {
        Some("Succeeded") => ValidationResult::ready(),
        Some("Failed") => ValidationResult::failed(format!(
            "pod failed: {}",
            status.get("message").and_then(|m| m.as_str()).unwrap_or("no message")
        )),
        Some("Running") if condition_true(status, "Ready") => ValidationResult::ready(),
        _ => ValidationResult::pending(),
    }
}

fn validate_replicas(obj: &Value, status: &Value, ready_field: &str) -> ValidationResult {
    let observed = status.get("observedGeneration").and_then(|v| v.as_i64());
    let generation = obj.get("metadata").and_then(|m| m.get("generation")).and_then(|v| v.as_i64());
    if let (Some(o), Some(g)) = (observed, generation) {
        if o < g {
            return ValidationResult::pending();
        }
    }
    let desired = obj
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    let ready = status.get(ready_field).and_then(|v| v.as_i64()).unwrap_or(0);
    if ready >= desired {
        ValidationResult::ready()
    } else {
        ValidationResult::pending()
    }
}

fn validate_daemonset(status: &Value) -> ValidationResult {
    let desired = status.get("desiredNumberScheduled").and_then(|v| v.as_i64()).unwrap_or(0);
    let ready = status.get("numberReady").and_then(|v| v.as_i64()).unwrap_or(0);
    if ready >= desired {
        ValidationResult::ready()
    } else {
        ValidationResult::pending()
    }
}

fn validate_conditions(status: &Value) -> ValidationResult {
    for failure in ["Failed", "Stalled", "Degraded"] {
        if condition_true(status, failure) {
            return ValidationResult::failed(format!(
                "{} condition: {}",
                failure.to_ascii_lowercase(),
                condition_message(status, failure)
            ));
        }
    }
    let conditions = status.get("conditions").and_then(|c| c.as_array());
    let has_readiness_condition = conditions
        .map(|cs| {
            cs.iter().any(|c| {
                matches!(c.get("type").and_then(|t| t.as_str()), Some("Ready") | Some("Available"))
            })
        })
        .unwrap_or(false);
    if !has_readiness_condition {
        // Nothing to wait on; the kind doesn't report readiness.
        return ValidationResult::ready();
    }
    if condition_true(status, "Ready") || condition_true(status, "Available") {
        ValidationResult::ready()
    } else {
        ValidationResult::pending()
    }
}
