//! Rudder kube: thin client wrapper over kube-rs.
//!
//! Exposes the `ObjectClient` trait the engine drives (patch/update/delete/
//! get/list with dry-run forcing and API-warning capture) and the real
//! `KubeClient` implementation with a per-client discovery cache.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use metrics::counter;
use serde_json::Value;
use tracing::debug;

use rudder_core::objects::ref_from_object;
use rudder_core::ObjectRef;

pub mod warnings;

use warnings::{CaptureWarningsLayer, WarningSink};

/// Field manager name used for server-side apply.
pub const FIELD_MANAGER: &str = "rudder";

/// A warning the API server attached to a response (HTTP `Warning:` header).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ApiWarning {
    pub text: String,
}

/// One contested field from a rejected server-side apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCause {
    pub manager: String,
    pub field: String,
}

/// Structured view of a server-side-apply conflict rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictStatus {
    pub causes: Vec<ConflictCause>,
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field ownership conflict")?;
        for (i, c) in self.causes.iter().enumerate() {
            let sep = if i == 0 { ": " } else { ", " };
            write!(f, "{}{} (manager {:?})", sep, c.field, c.manager)?;
        }
        Ok(())
    }
}

/// Error classes the engine dispatches on. Everything that is not a
/// no-kind-match, not-found or parsed conflict lands in `Api`/`Other` and
/// goes through the replace ladder.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no matching kind registered on cluster: {0}")]
    NoKindMatch(String),
    #[error("object not found")]
    NotFound,
    #[error("{0}")]
    Conflict(ConflictStatus),
    #[error("api error ({code} {reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PatchOptions {
    pub force_dry_run: bool,
    pub force_apply: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub force_dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    pub force_dry_run: bool,
}

/// Result-plus-warnings pair: API warnings are returned even when the call
/// itself failed, so callers can attribute them to the reference.
pub type CallResult<T> = (Result<T, ClientError>, Vec<ApiWarning>);

/// The client surface the apply engine drives. Implementations must be safe
/// for concurrent use.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Server-side apply of the full object.
    async fn patch_object(&self, obj: &Value, opts: PatchOptions) -> CallResult<Value>;

    /// Full-object update (PUT) preserving the resourceVersion carried by `obj`.
    async fn update_object(&self, obj: &Value, opts: UpdateOptions) -> CallResult<Value>;

    async fn delete_object(&self, reference: &ObjectRef, opts: DeleteOptions) -> CallResult<()>;

    /// `None` when the object does not exist on the cluster.
    async fn get_object(&self, reference: &ObjectRef) -> CallResult<Option<Value>>;

    /// List objects of a GVK key ("v1/ConfigMap" or "group/v1/Kind"),
    /// optionally namespace-scoped and label-filtered.
    async fn list_objects(
        &self,
        gvk_key: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> CallResult<Vec<Value>>;
}

/// Parse a GVK key the same way object apiVersions are split: the kind is
/// the last segment, an optional group precedes the version.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let invalid = || anyhow!("invalid gvk key {key:?} (expected v1/Kind or group/v1/Kind)");
    let (prefix, kind) = key.rsplit_once('/').ok_or_else(invalid)?;
    if prefix.is_empty() || kind.is_empty() {
        return Err(invalid());
    }
    let (group, version) = match prefix.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), prefix.to_string()),
    };
    if version.is_empty() || version.contains('/') {
        return Err(invalid());
    }
    Ok(GroupVersionKind { group, version, kind: kind.to_string() })
}

/// An api resource together with its cluster/namespace scope.
#[derive(Clone)]
struct ScopedResource {
    resource: kube::core::ApiResource,
    namespaced: bool,
}

/// Per-client cache of everything discovery served, so a collection touching
/// many kinds pays for discovery once. A miss refreshes the whole cache; a
/// kind still absent afterwards is not registered on the cluster.
#[derive(Default)]
struct DiscoveryCache {
    entries: RwLock<HashMap<(String, String, String), ScopedResource>>,
}

impl DiscoveryCache {
    fn lookup(&self, gvk: &GroupVersionKind) -> Option<ScopedResource> {
        self.entries
            .read()
            .unwrap()
            .get(&(gvk.group.clone(), gvk.version.clone(), gvk.kind.clone()))
            .cloned()
    }

    async fn refresh(&self, client: Client) -> Result<(), ClientError> {
        let discovery = Discovery::new(client)
            .run()
            .await
            .map_err(|e| ClientError::Other(anyhow!(e).context("running api discovery")))?;
        let mut entries = self.entries.write().unwrap();
        for group in discovery.groups() {
            for (resource, capabilities) in group.recommended_resources() {
                let scoped = ScopedResource {
                    namespaced: matches!(capabilities.scope, Scope::Namespaced),
                    resource: resource.clone(),
                };
                entries.insert(
                    (resource.group.clone(), resource.version.clone(), resource.kind.clone()),
                    scoped,
                );
            }
        }
        Ok(())
    }

    async fn resolve(
        &self,
        client: Client,
        gvk: &GroupVersionKind,
    ) -> Result<ScopedResource, ClientError> {
        if let Some(hit) = self.lookup(gvk) {
            return Ok(hit);
        }
        self.refresh(client).await?;
        self.lookup(gvk).ok_or_else(|| {
            let api_version = if gvk.group.is_empty() {
                gvk.version.clone()
            } else {
                format!("{}/{}", gvk.group, gvk.version)
            };
            ClientError::NoKindMatch(format!("{}/{}", api_version, gvk.kind))
        })
    }
}

/// Parse the field conflicts out of a 409 server-side-apply rejection
/// message. The server phrases each group as
/// `conflict(s) with "<manager>"[ using <version>]: .path[, .path...]`,
/// groups joined by `;`.
pub fn parse_conflict_message(msg: &str) -> ConflictStatus {
    let mut causes = Vec::new();
    let mut rest = msg;
    while let Some(i) = rest.find("with \"") {
        rest = &rest[i + 6..];
        let Some(j) = rest.find('"') else { break };
        let manager = rest[..j].to_string();
        rest = &rest[j + 1..];
        let Some(k) = rest.find(": ") else { break };
        let after = &rest[k + 2..];
        let end = after.find(';').unwrap_or(after.len());
        for field in after[..end].split(',') {
            let field = field.trim();
            if field.starts_with('.') {
                causes.push(ConflictCause { manager: manager.clone(), field: field.to_string() });
            }
        }
        rest = &after[end..];
    }
    ConflictStatus { causes }
}

fn map_kube_err(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(ae) => {
            if ae.code == 404 {
                ClientError::NotFound
            } else if ae.code == 409 && ae.reason == "Conflict" {
                let status = parse_conflict_message(&ae.message);
                if status.causes.is_empty() {
                    ClientError::Api { code: ae.code, reason: ae.reason, message: ae.message }
                } else {
                    ClientError::Conflict(status)
                }
            } else {
                ClientError::Api { code: ae.code, reason: ae.reason, message: ae.message }
            }
        }
        other => ClientError::Other(anyhow!(other)),
    }
}

fn to_value(obj: DynamicObject) -> Result<Value, ClientError> {
    serde_json::to_value(&obj)
        .map_err(|e| ClientError::Other(anyhow!(e).context("serializing api object")))
}

/// Real client. Mutating calls honor per-call dry-run forcing; warnings are
/// captured off the HTTP layer and attributed by request path.
pub struct KubeClient {
    client: Client,
    warnings: WarningSink,
    discovery: DiscoveryCache,
}

impl KubeClient {
    pub async fn try_default() -> Result<Self> {
        let config = kube::Config::infer().await.context("inferring kube config")?;
        let sink = WarningSink::default();
        let client = kube::client::ClientBuilder::try_from(config)
            .context("building kube client")?
            .with_layer(&CaptureWarningsLayer::new(sink.clone()))
            .build();
        Ok(Self { client, warnings: sink, discovery: DiscoveryCache::default() })
    }

    async fn api_for(&self, reference: &ObjectRef) -> Result<(Api<DynamicObject>, String), ClientError> {
        let gvk = GroupVersionKind {
            group: reference.group.clone(),
            version: reference.version.clone(),
            kind: reference.kind.clone(),
        };
        let scoped = self.discovery.resolve(self.client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = if scoped.namespaced {
            match reference.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &scoped.resource),
                None => Api::default_namespaced_with(self.client.clone(), &scoped.resource),
            }
        } else {
            Api::all_with(self.client.clone(), &scoped.resource)
        };
        let ns = if scoped.namespaced {
            reference
                .namespace
                .clone()
                .or_else(|| Some(self.client.default_namespace().to_string()))
        } else {
            None
        };
        let path = object_path(&scoped.resource, ns.as_deref(), Some(&reference.name));
        Ok((api, path))
    }
}

/// URL path of an object (or its collection when `name` is `None`), used to
/// attribute captured warnings. References are unique per run, so the path
/// identifies the call's subject.
fn object_path(ar: &kube::core::ApiResource, namespace: Option<&str>, name: Option<&str>) -> String {
    let mut p = if ar.group.is_empty() {
        format!("/api/{}", ar.version)
    } else {
        format!("/apis/{}/{}", ar.group, ar.version)
    };
    if let Some(ns) = namespace {
        p.push_str(&format!("/namespaces/{}", ns));
    }
    p.push_str(&format!("/{}", ar.plural));
    if let Some(n) = name {
        p.push_str(&format!("/{}", n));
    }
    p
}

#[async_trait]
impl ObjectClient for KubeClient {
    async fn patch_object(&self, obj: &Value, opts: PatchOptions) -> CallResult<Value> {
        counter!("kube_patch_total", 1u64);
        let reference = match ref_from_object(obj) {
            Ok(r) => r,
            Err(e) => return (Err(ClientError::Other(e)), Vec::new()),
        };
        debug!(reference = %reference, force = opts.force_apply, dry_run = opts.force_dry_run, "server-side apply");
        let (api, path) = match self.api_for(&reference).await {
            Ok(x) => x,
            Err(e) => return (Err(e), Vec::new()),
        };
        let mut pp = PatchParams::apply(FIELD_MANAGER);
        if opts.force_apply {
            pp = pp.force();
        }
        if opts.force_dry_run {
            pp = pp.dry_run();
        }
        let res = api.patch(&reference.name, &pp, &Patch::Apply(obj)).await;
        let w = self.warnings.drain(&path);
        (res.map_err(map_kube_err).and_then(to_value), w)
    }

    async fn update_object(&self, obj: &Value, opts: UpdateOptions) -> CallResult<Value> {
        counter!("kube_update_total", 1u64);
        let reference = match ref_from_object(obj) {
            Ok(r) => r,
            Err(e) => return (Err(ClientError::Other(e)), Vec::new()),
        };
        let (api, path) = match self.api_for(&reference).await {
            Ok(x) => x,
            Err(e) => return (Err(e), Vec::new()),
        };
        let dyn_obj: DynamicObject = match serde_json::from_value(obj.clone()) {
            Ok(o) => o,
            Err(e) => {
                return (
                    Err(ClientError::Other(anyhow!(e).context("converting object for update"))),
                    Vec::new(),
                )
            }
        };
        let pp = PostParams {
            dry_run: opts.force_dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        let res = api.replace(&reference.name, &pp, &dyn_obj).await;
        let w = self.warnings.drain(&path);
        (res.map_err(map_kube_err).and_then(to_value), w)
    }

    async fn delete_object(&self, reference: &ObjectRef, opts: DeleteOptions) -> CallResult<()> {
        counter!("kube_delete_total", 1u64);
        let (api, path) = match self.api_for(reference).await {
            Ok(x) => x,
            Err(e) => return (Err(e), Vec::new()),
        };
        let dp = DeleteParams { dry_run: opts.force_dry_run, ..Default::default() };
        let res = api.delete(&reference.name, &dp).await;
        let w = self.warnings.drain(&path);
        (res.map(|_| ()).map_err(map_kube_err), w)
    }

    async fn get_object(&self, reference: &ObjectRef) -> CallResult<Option<Value>> {
        let (api, path) = match self.api_for(reference).await {
            Ok(x) => x,
            Err(e) => return (Err(e), Vec::new()),
        };
        let res = api.get_opt(&reference.name).await;
        let w = self.warnings.drain(&path);
        let mapped = match res {
            Ok(Some(o)) => to_value(o).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(map_kube_err(e)),
        };
        (mapped, w)
    }

    async fn list_objects(
        &self,
        gvk_key: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> CallResult<Vec<Value>> {
        let gvk = match parse_gvk_key(gvk_key) {
            Ok(g) => g,
            Err(e) => return (Err(ClientError::Other(e)), Vec::new()),
        };
        let scoped = match self.discovery.resolve(self.client.clone(), &gvk).await {
            Ok(x) => x,
            Err(e) => return (Err(e), Vec::new()),
        };
        let api: Api<DynamicObject> = if scoped.namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &scoped.resource),
                None => Api::default_namespaced_with(self.client.clone(), &scoped.resource),
            }
        } else {
            Api::all_with(self.client.clone(), &scoped.resource)
        };
        let ns = if scoped.namespaced {
            namespace
                .map(|s| s.to_string())
                .or_else(|| Some(self.client.default_namespace().to_string()))
        } else {
            None
        };
        let path = object_path(&scoped.resource, ns.as_deref(), None);
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let res = api.list(&lp).await;
        let w = self.warnings.drain(&path);
        let mapped = match res {
            Ok(list) => list.items.into_iter().map(to_value).collect::<Result<Vec<_>, _>>(),
            Err(e) => Err(map_kube_err(e)),
        };
        (mapped, w)
    }
}
