//! Rudder core types: object references, deployment collections, apply options.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod objects;
pub mod validate;

/// Stable identity of a managed Kubernetes object: (group, version, kind, namespace, name).
/// Totally ordered so collections of refs iterate deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.gvk_key(), ns, self.name),
            None => write!(f, "{}/{}", self.gvk_key(), self.name),
        }
    }
}

/// One bundle of manifests sharing lifecycle metadata; the scheduler's quantum.
/// Immutable once scheduled.
#[derive(Debug, Clone, Default)]
pub struct DeploymentItem {
    /// Bundle directory relative to the project root, used for logging.
    pub path: String,
    pub tags: BTreeSet<String>,
    /// Drain all prior work before the next item is dispatched.
    pub barrier: bool,
    /// Wait for applied objects to report ready before running post hooks.
    pub wait_readiness: bool,
    pub objects: Vec<serde_json::Value>,
}

/// Ordered sequence of deployment items. Order is authoritative.
#[derive(Debug, Clone, Default)]
pub struct DeploymentCollection {
    pub items: Vec<DeploymentItem>,
    /// Variables resolved by the project loader; recorded in the command result.
    pub vars: serde_json::Value,
    /// Image pins the loader applied while loading the bundles.
    pub images: Vec<FixedImage>,
}

impl DeploymentCollection {
    /// All object references in the collection, in declared order.
    pub fn all_refs(&self) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        for item in &self.items {
            for o in &item.objects {
                if let Ok(r) = objects::ref_from_object(o) {
                    out.push(r);
                }
            }
        }
        out
    }
}

/// An image pin: containers whose image repository matches `image` are
/// rewritten to `result_image` at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedImage {
    pub image: String,
    pub result_image: String,
}

/// Per-run knobs. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// On field-conflict, overwrite rather than resolve.
    pub force_apply: bool,
    /// On non-conflict patch failure, retry via full-object update.
    pub replace_on_error: bool,
    /// On update failure, delete then re-create.
    pub force_replace_on_error: bool,
    /// All mutating calls carry the server-side dry-run directive.
    pub dry_run: bool,
    /// First recorded error stops scheduling further items.
    pub abort_on_error: bool,
    /// Per-hook readiness deadline. Zero means unbounded.
    pub hook_timeout: Duration,
    /// Cadence of readiness probes.
    pub hook_poll_interval: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            force_apply: false,
            replace_on_error: false,
            force_replace_on_error: false,
            dry_run: false,
            abort_on_error: false,
            hook_timeout: Duration::ZERO,
            hook_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Tag/dir based item selection from CLI flags. Empty include sets mean
/// "everything not excluded".
#[derive(Debug, Clone, Default)]
pub struct InclusionFilter {
    pub include_tags: BTreeSet<String>,
    pub exclude_tags: BTreeSet<String>,
    pub include_dirs: BTreeSet<String>,
    pub exclude_dirs: BTreeSet<String>,
}

impl InclusionFilter {
    pub fn is_empty(&self) -> bool {
        self.include_tags.is_empty()
            && self.exclude_tags.is_empty()
            && self.include_dirs.is_empty()
            && self.exclude_dirs.is_empty()
    }

    pub fn includes(&self, item: &DeploymentItem) -> bool {
        if item.tags.iter().any(|t| self.exclude_tags.contains(t)) {
            return false;
        }
        if self.exclude_dirs.contains(&item.path) {
            return false;
        }
        if self.include_tags.is_empty() && self.include_dirs.is_empty() {
            return true;
        }
        item.tags.iter().any(|t| self.include_tags.contains(t))
            || self.include_dirs.contains(&item.path)
    }
}
