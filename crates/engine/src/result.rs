//! Result assembly: once the scheduler returns, fold the ledger and the
//! pre-run cache into the command result handed to the result store.

use chrono::{DateTime, Utc};
use rudder_core::objects::strip_server_noise;
use rudder_core::{DeploymentCollection, FixedImage, ObjectRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ApplyContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }

    fn merge(&mut self, other: DiffSummary) {
        self.adds += other.adds;
        self.updates += other.updates;
        self.removes += other.removes;
    }
}

/// Field-level summary of what applying `desired` changes relative to the
/// `live` document: fields only in `desired` count as adds, fields only in
/// `live` as removes, differing leaves as updates.
pub fn diff_summary(desired: &Value, live: &Value) -> DiffSummary {
    if desired == live {
        return DiffSummary::default();
    }
    match (desired, live) {
        (Value::Object(desired), Value::Object(live)) => {
            let mut summary = DiffSummary::default();
            for (key, value) in desired {
                match live.get(key) {
                    None => summary.adds += 1,
                    Some(live_value) => summary.merge(diff_summary(value, live_value)),
                }
            }
            summary.removes += live.keys().filter(|k| !desired.contains_key(*k)).count();
            summary
        }
        (Value::Array(desired), Value::Array(live)) => {
            let mut summary = DiffSummary::default();
            summary.updates = desired.iter().zip(live).filter(|(d, l)| d != l).count();
            if desired.len() > live.len() {
                summary.adds = desired.len() - live.len();
            } else {
                summary.removes = live.len() - desired.len();
            }
            summary
        }
        // Scalars, or a type change of the whole subtree.
        _ => DiffSummary { updates: 1, ..Default::default() },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    pub reference: ObjectRef,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedObject {
    pub reference: ObjectRef,
    pub summary: DiffSummary,
}

/// The sole external artifact of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub id: String,
    pub project: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub new_objects: Vec<ObjectRef>,
    pub changed_objects: Vec<ChangedObject>,
    pub deleted_objects: Vec<ObjectRef>,
    pub hook_objects: Vec<ObjectRef>,
    pub errors: Vec<ResultEntry>,
    pub warnings: Vec<ResultEntry>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub vars: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<FixedImage>,
}

impl CommandResult {
    /// Exit status of the run: ok iff no errors were recorded.
    pub fn exit_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub(crate) fn assemble(
    ctx: &ApplyContext,
    collection: &DeploymentCollection,
    id: String,
    project: String,
    started_at: DateTime<Utc>,
) -> CommandResult {
    let snap = ctx.ledger.snapshot();

    let mut new_objects = Vec::new();
    let mut changed_objects = Vec::new();
    for (reference, applied) in &snap.applied {
        match ctx.cache.get(reference) {
            None => new_objects.push(reference.clone()),
            Some(remote) => {
                let summary =
                    diff_summary(&strip_server_noise(applied), &strip_server_noise(remote));
                if !summary.is_empty() {
                    changed_objects.push(ChangedObject { reference: reference.clone(), summary });
                }
            }
        }
    }

    let flatten = |m: &std::collections::BTreeMap<ObjectRef, Vec<String>>| {
        m.iter()
            .flat_map(|(r, msgs)| {
                msgs.iter()
                    .map(|m| ResultEntry { reference: r.clone(), message: m.clone() })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
    };

    CommandResult {
        id,
        project,
        dry_run: ctx.opts.dry_run,
        started_at,
        finished_at: Utc::now(),
        new_objects,
        changed_objects,
        deleted_objects: snap.deleted.iter().cloned().collect(),
        hook_objects: snap.applied_hooks.keys().cloned().collect(),
        errors: flatten(&snap.errors),
        warnings: flatten(&snap.warnings),
        vars: collection.vars.clone(),
        images: collection.images.clone(),
    }
}
