//! Helpers for dynamic object documents (`serde_json::Value` trees).

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::ObjectRef;

/// Extract the identity quintuple from a document. Fails with a friendly
/// message when apiVersion/kind/metadata.name are missing.
pub fn ref_from_object(obj: &Value) -> Result<ObjectRef> {
    let api_version = obj
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("object missing apiVersion"))?;
    let kind = obj
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("object missing kind"))?
        .to_string();
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    let name = obj
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("object missing metadata.name"))?
        .to_string();
    let namespace = obj
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Ok(ObjectRef { group, version, kind, namespace, name })
}

/// Read an annotation value off a document.
pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get("metadata")?
        .get("annotations")?
        .get(key)?
        .as_str()
}

/// Set metadata.resourceVersion, creating metadata if absent.
pub fn set_resource_version(obj: &mut Value, rv: &str) {
    if let Some(root) = obj.as_object_mut() {
        let meta = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
        }
    }
}

pub fn resource_version(obj: &Value) -> Option<&str> {
    obj.get("metadata")?.get("resourceVersion")?.as_str()
}

/// Strip fields that break server-side apply of a rendered manifest:
/// server-managed metadata and a zero-valued status. The rewritten object,
/// applied against a fresh cluster, produces an equivalent resource.
pub fn fix_object_for_patch(obj: &Value) -> Value {
    let mut v = obj.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("creationTimestamp");
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("uid");
    }
    let drop_status = v.get("status").map(is_zero_value).unwrap_or(false);
    if drop_status {
        if let Some(root) = v.as_object_mut() {
            root.remove("status");
        }
    }
    v
}

/// Strip server-populated noise before diffing pre/post apply content.
pub fn strip_server_noise(obj: &Value) -> Value {
    let mut v = obj.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("creationTimestamp");
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("uid");
    }
    if let Some(root) = v.as_object_mut() {
        root.remove("status");
    }
    v
}

/// A value is "zero" when it is null, an empty/zero scalar, or a container
/// holding only zero values.
pub fn is_zero_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.iter().all(is_zero_value),
        Value::Object(m) => m.values().all(is_zero_value),
    }
}
