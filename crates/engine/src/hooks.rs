//! Lifecycle hooks: classification by annotation, phase selection, serial
//! weight-ordered execution and readiness polling.

use std::collections::BTreeSet;
use std::time::Instant;

use anyhow::{anyhow, Result};
use metrics::histogram;
use rudder_core::objects::{annotation, ref_from_object};
use rudder_core::validate::validate_object;
use rudder_core::ObjectRef;
use rudder_kube::ClientError;
use serde_json::Value;
use tracing::debug;

use crate::apply::{apply_object, delete_object};
use crate::ApplyContext;

pub const HOOK_ANNOTATION: &str = "rudder.io/hook";
pub const HOOK_WEIGHT_ANNOTATION: &str = "rudder.io/hook-weight";
pub const HOOK_DELETE_POLICY_ANNOTATION: &str = "rudder.io/hook-delete-policy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookPhase {
    PreDeployInitial,
    PreDeployUpgrade,
    PreDeploy,
    PostDeployInitial,
    PostDeployUpgrade,
    PostDeploy,
}

impl HookPhase {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre-deploy-initial" => Some(Self::PreDeployInitial),
            "pre-deploy-upgrade" => Some(Self::PreDeployUpgrade),
            "pre-deploy" => Some(Self::PreDeploy),
            "post-deploy-initial" => Some(Self::PostDeployInitial),
            "post-deploy-upgrade" => Some(Self::PostDeployUpgrade),
            "post-deploy" => Some(Self::PostDeploy),
            _ => None,
        }
    }

    /// Pre phases for an item, picked by the initial-vs-upgrade rule.
    pub fn pre(initial: bool) -> &'static [HookPhase] {
        if initial {
            &[Self::PreDeployInitial, Self::PreDeploy]
        } else {
            &[Self::PreDeployUpgrade, Self::PreDeploy]
        }
    }

    pub fn post(initial: bool) -> &'static [HookPhase] {
        if initial {
            &[Self::PostDeployInitial, Self::PostDeploy]
        } else {
            &[Self::PostDeployUpgrade, Self::PostDeploy]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDeletePolicy {
    #[default]
    BeforeHookCreation,
    HookSucceeded,
    HookFailed,
    Never,
}

impl HookDeletePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "before-hook-creation" => Some(Self::BeforeHookCreation),
            "hook-succeeded" => Some(Self::HookSucceeded),
            "hook-failed" => Some(Self::HookFailed),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hook {
    pub object: Value,
    pub reference: ObjectRef,
    pub phases: BTreeSet<HookPhase>,
    pub weight: i64,
    pub delete_policy: HookDeletePolicy,
}

/// Classify an object: `Some(Hook)` when it carries a hook annotation,
/// `None` for regular objects, `Err` on malformed hook metadata.
pub fn classify_hook(obj: &Value) -> Result<Option<Hook>> {
    let Some(raw) = annotation(obj, HOOK_ANNOTATION) else {
        return Ok(None);
    };
    let reference = ref_from_object(obj)?;
    let mut phases = BTreeSet::new();
    for p in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let phase = HookPhase::parse(p)
            .ok_or_else(|| anyhow!("unknown hook phase {p:?} on {reference}"))?;
        phases.insert(phase);
    }
    if phases.is_empty() {
        return Err(anyhow!("hook annotation without phases on {reference}"));
    }
    let weight = match annotation(obj, HOOK_WEIGHT_ANNOTATION) {
        Some(w) => w
            .trim()
            .parse::<i64>()
            .map_err(|_| anyhow!("invalid hook weight {w:?} on {reference}"))?,
        None => 0,
    };
    let delete_policy = match annotation(obj, HOOK_DELETE_POLICY_ANNOTATION) {
        Some(p) => HookDeletePolicy::parse(p)
            .ok_or_else(|| anyhow!("unknown hook delete policy {p:?} on {reference}"))?,
        None => HookDeletePolicy::default(),
    };
    Ok(Some(Hook { object: obj.clone(), reference, phases, weight, delete_policy }))
}

/// Run every hook of the item matching one of `phases`, sequentially, in
/// weight order (ties broken by reference order). Each hook is applied and
/// then waited on before the next starts. Returns false as soon as one hook
/// fails; remaining hooks of the phase do not run.
pub async fn run_hooks(ctx: &ApplyContext, item_path: &str, hooks: &[Hook], phases: &[HookPhase]) -> bool {
    let mut selected: Vec<&Hook> = hooks
        .iter()
        .filter(|h| phases.iter().any(|p| h.phases.contains(p)))
        .collect();
    selected.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.reference.cmp(&b.reference)));

    for hook in selected {
        debug!(reference = %hook.reference, weight = hook.weight, "running hook");
        let deleted_first = hook.delete_policy == HookDeletePolicy::BeforeHookCreation
            && ctx.cache.contains(&hook.reference);
        if deleted_first && !delete_object(ctx, &hook.reference).await {
            return false;
        }

        apply_object(ctx, &hook.object, deleted_first, true).await;
        if ctx.ledger.has_error(&hook.reference) {
            ctx.reporter.warning(item_path, &format!("hook {} failed to apply", hook.reference));
            return false;
        }

        let ready = wait_ready(ctx, &hook.reference, "hook").await;
        match (ready, hook.delete_policy) {
            (true, HookDeletePolicy::HookSucceeded) => {
                delete_object(ctx, &hook.reference).await;
            }
            (false, HookDeletePolicy::HookFailed) => {
                delete_object(ctx, &hook.reference).await;
            }
            _ => {}
        }
        if !ready {
            return false;
        }
    }
    true
}

/// Poll an object until its validation reports ready. Records errors for
/// validation failures, disappearance and timeout. Dry runs skip the wait
/// entirely.
pub async fn wait_ready(ctx: &ApplyContext, reference: &ObjectRef, what: &str) -> bool {
    if ctx.opts.dry_run {
        return true;
    }
    debug!(reference = %reference, "waiting for {what} to get ready");

    let start = Instant::now();
    let mut did_log = false;
    loop {
        let (res, warnings) = ctx.client.get_object(reference).await;
        ctx.ledger.record_api_warnings(reference, warnings);
        match res {
            Ok(Some(obj)) => {
                let v = validate_object(&obj);
                if v.ready {
                    if did_log {
                        ctx.reporter.info(&reference.to_string(), &format!("finished waiting for {what}"));
                    }
                    histogram!("readiness_wait_ms", start.elapsed().as_secs_f64() * 1000.0);
                    return true;
                }
                if !v.errors.is_empty() {
                    for e in v.errors {
                        ctx.ledger.record_error(reference, e);
                    }
                    return false;
                }
            }
            Ok(None) | Err(ClientError::NotFound) => {
                ctx.ledger
                    .record_error(reference, "object disappeared while waiting for it to become ready");
                return false;
            }
            Err(e) => {
                ctx.ledger.record_error(reference, e.to_string());
                return false;
            }
        }

        if !ctx.opts.hook_timeout.is_zero() && start.elapsed() >= ctx.opts.hook_timeout {
            let msg = format!("timed out while waiting for {what}");
            ctx.reporter.warning(&reference.to_string(), &msg);
            ctx.ledger.record_error(reference, msg);
            return false;
        }
        if !did_log {
            ctx.reporter.info(&reference.to_string(), &format!("waiting for {what} to get ready..."));
            did_log = true;
        }
        tokio::time::sleep(ctx.opts.hook_poll_interval).await;
    }
}
