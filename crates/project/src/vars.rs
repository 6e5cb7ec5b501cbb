//! Variable sources: each source resolves to one tree; sources are merged in
//! order into the project's variable set (later sources win). Cluster-backed
//! sources read through the object client.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use rudder_core::ObjectRef;
use rudder_kube::{ClientError, ObjectClient};

/// One variable source; exactly one of the fields must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VarsSource {
    /// Inline values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
    /// YAML file relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Tree whose string leaves name environment variables to resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_env_vars: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_config_map: Option<ClusterObjectSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_secret: Option<ClusterObjectSource>,
    /// Missing files/objects/env vars resolve to nothing instead of failing.
    #[serde(default)]
    pub ignore_missing: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterObjectSource {
    pub name: String,
    pub namespace: String,
    /// Data key holding the YAML payload.
    pub key: String,
}

pub struct VarsLoader<'a> {
    client: Option<&'a dyn ObjectClient>,
}

impl<'a> VarsLoader<'a> {
    pub fn new(client: Option<&'a dyn ObjectClient>) -> Self {
        Self { client }
    }

    /// Resolve all sources in order into one merged tree.
    pub async fn load_all(&self, sources: &[VarsSource], search_dir: &Path) -> Result<Value> {
        let mut merged = Value::Object(Map::new());
        for (i, source) in sources.iter().enumerate() {
            let loaded = self
                .load(source, search_dir)
                .await
                .with_context(|| format!("vars source #{i}"))?;
            // An empty file or fully-ignored env tree resolves to null;
            // merging that would wipe everything loaded so far.
            if let Some(v) = loaded.filter(|v| !v.is_null()) {
                merge_values(&mut merged, &v);
            }
        }
        Ok(merged)
    }

    async fn load(&self, source: &VarsSource, search_dir: &Path) -> Result<Option<Value>> {
        let set = [
            source.values.is_some(),
            source.file.is_some(),
            source.system_env_vars.is_some(),
            source.cluster_config_map.is_some(),
            source.cluster_secret.is_some(),
        ];
        if set.iter().filter(|s| **s).count() != 1 {
            bail!("invalid vars source: exactly one of values/file/systemEnvVars/clusterConfigMap/clusterSecret must be set");
        }

        if let Some(values) = &source.values {
            return Ok(Some(values.clone()));
        }
        if let Some(file) = &source.file {
            return self.load_file(search_dir, file, source.ignore_missing);
        }
        if let Some(tree) = &source.system_env_vars {
            return resolve_env(tree, source.ignore_missing).map(Some);
        }
        if let Some(src) = &source.cluster_config_map {
            return self.load_cluster_object(src, "ConfigMap", false, source.ignore_missing).await;
        }
        if let Some(src) = &source.cluster_secret {
            return self.load_cluster_object(src, "Secret", true, source.ignore_missing).await;
        }
        unreachable!("source variant checked above");
    }

    fn load_file(&self, search_dir: &Path, file: &str, ignore_missing: bool) -> Result<Option<Value>> {
        let path = search_dir.join(file);
        if !path.exists() {
            if ignore_missing {
                debug!(file = %path.display(), "vars file missing, ignoring");
                return Ok(None);
            }
            bail!("vars file {} not found", path.display());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let v: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(v))
    }

    async fn load_cluster_object(
        &self,
        src: &ClusterObjectSource,
        kind: &str,
        secret: bool,
        ignore_missing: bool,
    ) -> Result<Option<Value>> {
        let client = self
            .client
            .ok_or_else(|| anyhow!("cluster vars source needs a cluster connection"))?;
        let reference = ObjectRef {
            group: String::new(),
            version: "v1".into(),
            kind: kind.into(),
            namespace: Some(src.namespace.clone()),
            name: src.name.clone(),
        };
        let (res, _warnings) = client.get_object(&reference).await;
        let obj = match res {
            Ok(Some(o)) => o,
            Ok(None) | Err(ClientError::NotFound) => {
                if ignore_missing {
                    debug!(reference = %reference, "cluster vars object missing, ignoring");
                    return Ok(None);
                }
                bail!("{reference} not found");
            }
            Err(e) => return Err(anyhow!(e).context(format!("fetching {reference}"))),
        };
        let raw = obj
            .get("data")
            .and_then(|d| d.get(&src.key))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("{} has no data key {:?}", reference, src.key))?;
        let text = if secret {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(raw)
                .with_context(|| format!("decoding {} data key {:?}", reference, src.key))?;
            String::from_utf8(bytes)
                .with_context(|| format!("{} data key {:?} is not utf-8", reference, src.key))?
        } else {
            raw.to_string()
        };
        let v: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {} data key {:?}", reference, src.key))?;
        Ok(Some(v))
    }
}

/// Replace every string leaf with the named environment variable's value.
fn resolve_env(tree: &Value, ignore_missing: bool) -> Result<Value> {
    match tree {
        Value::String(name) => match std::env::var(name) {
            Ok(v) => Ok(Value::String(v)),
            Err(_) if ignore_missing => Ok(Value::Null),
            Err(_) => bail!("environment variable {name:?} not set"),
        },
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let resolved = resolve_env(v, ignore_missing)?;
                if !resolved.is_null() {
                    out.insert(k.clone(), resolved);
                }
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Deep merge: maps merge recursively, everything else is replaced by `src`.
pub fn merge_values(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(d), Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        d.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

/// Convenience for callers assembling sources programmatically.
pub fn values_source(values: Value) -> VarsSource {
    VarsSource { values: Some(values), ..Default::default() }
}
