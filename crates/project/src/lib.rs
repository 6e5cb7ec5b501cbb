//! Rudder project loader: turns a project directory of rendered manifest
//! bundles into an ordered deployment collection.
//!
//! A project is a `deployment.yaml` naming bundle directories (with optional
//! barrier/readiness/tag metadata and variable sources) plus one directory of
//! multi-document YAML manifests per bundle.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use rudder_core::objects::ref_from_object;
use rudder_core::{DeploymentCollection, DeploymentItem, FixedImage, ObjectRef};
use rudder_kube::ObjectClient;

pub mod vars;

/// `deployment.yaml` at the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub deployments: Vec<ItemConfig>,
    #[serde(default)]
    pub vars: Vec<vars::VarsSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ItemConfig {
    /// Bundle directory, relative to the project root.
    pub path: String,
    #[serde(default)]
    pub barrier: bool,
    #[serde(default)]
    pub wait_readiness: bool,
    /// Inclusion tags. Defaults to the bundle path.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Load a project directory into a deployment collection. Variable sources
/// are resolved in order (cluster sources need `client`), image pins are
/// applied to every loaded object, and duplicate references across bundles
/// are rejected.
pub async fn load_project(
    dir: &Path,
    client: Option<&dyn ObjectClient>,
    images: Vec<FixedImage>,
) -> Result<DeploymentCollection> {
    let config = read_config(dir)?;
    let resolved_vars = vars::VarsLoader::new(client)
        .load_all(&config.vars, dir)
        .await
        .context("resolving project vars")?;

    let mut items = Vec::with_capacity(config.deployments.len());
    let mut seen: BTreeSet<ObjectRef> = BTreeSet::new();
    for ic in &config.deployments {
        let bundle_dir = dir.join(&ic.path);
        let mut objects = load_bundle(&bundle_dir)
            .with_context(|| format!("loading bundle {:?}", ic.path))?;
        for obj in &mut objects {
            let reference = ref_from_object(obj)
                .with_context(|| format!("in bundle {:?}", ic.path))?;
            if !seen.insert(reference.clone()) {
                bail!("duplicate object {} in bundle {:?}", reference, ic.path);
            }
            rewrite_images(obj, &images);
        }
        let tags: BTreeSet<String> = if ic.tags.is_empty() {
            BTreeSet::from([ic.path.clone()])
        } else {
            ic.tags.iter().cloned().collect()
        };
        debug!(path = %ic.path, objects = objects.len(), barrier = ic.barrier, "loaded bundle");
        items.push(DeploymentItem {
            path: ic.path.clone(),
            tags,
            barrier: ic.barrier,
            wait_readiness: ic.wait_readiness,
            objects,
        });
    }

    Ok(DeploymentCollection { items, vars: resolved_vars, images })
}

fn read_config(dir: &Path) -> Result<ProjectConfig> {
    for name in ["deployment.yaml", "deployment.yml"] {
        let path = dir.join(name);
        if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            return serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()));
        }
    }
    Err(anyhow!("no deployment.yaml found in {}", dir.display()))
}

/// Read every YAML file of a bundle dir (sorted by name) as a multi-document
/// stream. Empty documents are skipped; everything else must be a mapping.
fn load_bundle(dir: &Path) -> Result<Vec<Value>> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("reading bundle dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();

    let mut objects = Vec::new();
    for file in files {
        let text = fs::read_to_string(&file)
            .with_context(|| format!("reading {}", file.display()))?;
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = Value::deserialize(doc)
                .with_context(|| format!("parsing {}", file.display()))?;
            if value.is_null() {
                continue;
            }
            if !value.is_object() {
                bail!("{}: manifest document is not a mapping", file.display());
            }
            ref_from_object(&value).with_context(|| format!("in {}", file.display()))?;
            objects.push(value);
        }
    }
    Ok(objects)
}

/// Rewrite container images matching a pin's repository. Covers pod specs
/// both inline and under workload templates, including init containers.
fn rewrite_images(obj: &mut Value, images: &[FixedImage]) {
    if images.is_empty() {
        return;
    }
    let specs = [
        "/spec/containers",
        "/spec/initContainers",
        "/spec/template/spec/containers",
        "/spec/template/spec/initContainers",
        "/spec/jobTemplate/spec/template/spec/containers",
        "/spec/jobTemplate/spec/template/spec/initContainers",
    ];
    for path in specs {
        let Some(containers) = obj.pointer_mut(path).and_then(|v| v.as_array_mut()) else {
            continue;
        };
        for container in containers {
            let Some(image) = container.get("image").and_then(|i| i.as_str()) else {
                continue;
            };
            let repo = image_repository(image);
            if let Some(pin) = images.iter().find(|p| p.image == repo) {
                container["image"] = Value::String(pin.result_image.clone());
            }
        }
    }
}

/// Repository part of an image spec: everything before a tag or digest.
fn image_repository(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    // The last colon separates the tag, unless it belongs to a registry port.
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => image,
    }
}
