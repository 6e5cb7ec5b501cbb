//! Rudder result store: persists command results as cluster-side Secrets.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use metrics::{counter, histogram};
use rudder_core::ObjectRef;
use rudder_engine::CommandResult;
use rudder_kube::{DeleteOptions, ObjectClient, PatchOptions};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const RESULT_LABEL: &str = "rudder.io/command-result";
const RESULT_DATA_KEY: &str = "result";

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn write_command_result(&self, result: &CommandResult) -> Result<()>;
}

/// Discards results; used when result writing is disabled.
pub struct NullResultStore;

#[async_trait]
impl ResultStore for NullResultStore {
    async fn write_command_result(&self, _result: &CommandResult) -> Result<()> {
        Ok(())
    }
}

fn result_keep_count() -> usize {
    std::env::var("RUDDER_RESULT_KEEP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(5)
}

/// Cluster-backed store: one Secret per result, zstd-compressed JSON payload,
/// pruned down to the latest N after each write.
pub struct SecretResultStore {
    client: Arc<dyn ObjectClient>,
    namespace: String,
    keep: usize,
}

impl SecretResultStore {
    pub fn new(client: Arc<dyn ObjectClient>, namespace: impl Into<String>) -> Self {
        Self { client, namespace: namespace.into(), keep: result_keep_count() }
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep;
        self
    }

    fn secret_for(&self, result: &CommandResult) -> Result<Value> {
        let payload = serde_json::to_vec(result).context("serializing command result")?;
        let compressed = zstd::encode_all(&payload[..], 0).context("compressing command result")?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(compressed);
        Ok(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": format!("rudder-result-{}", result.id),
                "namespace": self.namespace,
                "labels": { RESULT_LABEL: "true" },
            },
            "type": "Opaque",
            "data": { RESULT_DATA_KEY: encoded },
        }))
    }

    async fn prune(&self) -> Result<()> {
        let (res, _warnings) = self
            .client
            .list_objects("v1/Secret", Some(&self.namespace), Some(&format!("{RESULT_LABEL}=true")))
            .await;
        let mut secrets = res.map_err(|e| anyhow!(e).context("listing result secrets"))?;
        if secrets.len() <= self.keep {
            return Ok(());
        }
        // Oldest first: creationTimestamp is RFC 3339 and sorts as text; the
        // name breaks ties.
        secrets.sort_by_key(|s| {
            let ts = s
                .pointer("/metadata/creationTimestamp")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let name = s
                .pointer("/metadata/name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            (ts, name)
        });
        let excess = secrets.len() - self.keep;
        for victim in secrets.into_iter().take(excess) {
            let Ok(reference) = rudder_core::objects::ref_from_object(&victim) else {
                continue;
            };
            let (res, _w) = self.client.delete_object(&reference, DeleteOptions::default()).await;
            if let Err(e) = res {
                warn!(reference = %reference, error = %e, "pruning old result failed");
            } else {
                counter!("result_pruned_total", 1u64);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for SecretResultStore {
    async fn write_command_result(&self, result: &CommandResult) -> Result<()> {
        if result.dry_run {
            debug!(id = %result.id, "dry run, skipping result write");
            return Ok(());
        }
        let started = std::time::Instant::now();
        let secret = self.secret_for(result)?;
        let (res, _warnings) = self
            .client
            .patch_object(&secret, PatchOptions::default())
            .await;
        res.map_err(|e| anyhow!(e).context("writing command result secret"))?;
        counter!("result_written_total", 1u64);
        self.prune().await?;
        histogram!("result_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }
}

/// Decode the payload of a result Secret back into a command result.
pub fn decode_result_secret(secret: &Value) -> Result<CommandResult> {
    let reference = rudder_core::objects::ref_from_object(secret).unwrap_or_else(|_| ObjectRef::default());
    let raw = secret
        .pointer(&format!("/data/{RESULT_DATA_KEY}"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("{} has no {:?} data key", reference, RESULT_DATA_KEY))?;
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .context("decoding result payload")?;
    let payload = zstd::decode_all(&compressed[..]).context("decompressing result payload")?;
    serde_json::from_slice(&payload).context("parsing result payload")
}
