//! The per-object apply worker: server-side apply with a three-tier fallback
//! ladder. Outcomes are only visible through the ledger; nothing is thrown
//! across the worker boundary, so the scheduler can always account for
//! partial success.

use metrics::counter;
use rudder_core::objects::{fix_object_for_patch, ref_from_object, resource_version, set_resource_version};
use rudder_core::ObjectRef;
use rudder_kube::{ClientError, ConflictStatus, DeleteOptions, PatchOptions, UpdateOptions};
use serde_json::Value;
use tracing::{debug, warn};

use crate::conflict::resolve_conflicts;
use crate::ApplyContext;

/// Apply one object. `replaced` marks the re-apply after a delete on the
/// force-replace path; `hook` selects which applied map records the result.
pub async fn apply_object(ctx: &ApplyContext, obj: &Value, replaced: bool, hook: bool) {
    counter!("apply_attempts", 1u64);
    let reference = match ref_from_object(obj) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "dropping object without identity");
            return;
        }
    };
    debug!(reference = %reference, "applying object");

    let x = fix_object_for_patch(obj);
    let remote = ctx.cache.get(&reference);

    if ctx.opts.dry_run && replaced && remote.is_some() {
        // The non-dry-run counterpart of this path just deleted the object;
        // a dry-run apply against the still-existing remote could be
        // rejected. Simulate the deletion by recording the input as applied.
        ctx.ledger.record_result(x, hook);
        return;
    }

    let opts = PatchOptions { force_dry_run: ctx.opts.dry_run, force_apply: false };
    let (res, warnings) = ctx.client.patch_object(&x, opts).await;
    ctx.ledger.record_api_warnings(&reference, warnings);
    match res {
        Ok(applied) => {
            counter!("apply_ok", 1u64);
            ctx.ledger.record_result(applied, hook);
        }
        Err(e @ ClientError::NoKindMatch(_)) => {
            // The cluster does not know this resource; nothing to retry.
            counter!("apply_err", 1u64);
            ctx.ledger.record_error(&reference, e.to_string());
        }
        Err(ClientError::Conflict(status)) => {
            counter!("apply_conflicts_total", 1u64);
            retry_with_conflicts(ctx, &reference, &x, hook, remote, status).await;
        }
        Err(e) => {
            retry_with_replace(ctx, &reference, &x, hook, remote, e).await;
        }
    }
}

/// Conflict tier: resolve lost fields against the remote object (or skip
/// resolution under force-apply) and re-apply once with the force directive.
async fn retry_with_conflicts(
    ctx: &ApplyContext,
    reference: &ObjectRef,
    x: &Value,
    hook: bool,
    remote: Option<&Value>,
    status: ConflictStatus,
) {
    let x2 = if !ctx.opts.force_apply {
        // Resolution needs the remote object; without it the conflict is a
        // plain error.
        let Some(remote) = remote else {
            ctx.ledger
                .record_error(reference, ClientError::Conflict(status).to_string());
            return;
        };
        let (resolved, lost) = match resolve_conflicts(x, remote, &status) {
            Ok(r) => r,
            Err(e) => {
                ctx.ledger.record_error(reference, e.to_string());
                return;
            }
        };
        for lo in &lost {
            ctx.ledger.record_warning(
                reference,
                format!(
                    "conflict with manager {:?}. Not updating field '{}' as we lost field ownership",
                    lo.manager, lo.field
                ),
            );
        }
        resolved
    } else {
        x.clone()
    };

    let opts = PatchOptions { force_dry_run: ctx.opts.dry_run, force_apply: true };
    let (res, warnings) = ctx.client.patch_object(&x2, opts).await;
    ctx.ledger.record_api_warnings(reference, warnings);
    match res {
        Ok(applied) => {
            counter!("apply_ok", 1u64);
            ctx.ledger.record_result(applied, hook);
        }
        Err(e) => {
            // We didn't manage to solve it; do not fall through to replace.
            counter!("apply_err", 1u64);
            ctx.ledger.record_error(reference, e.to_string());
        }
    }
}

/// Replace tier: retry via full-object update carrying the remote
/// resourceVersion.
async fn retry_with_replace(
    ctx: &ApplyContext,
    reference: &ObjectRef,
    x: &Value,
    hook: bool,
    remote: Option<&Value>,
    apply_error: ClientError,
) {
    let Some(remote) = remote else {
        counter!("apply_err", 1u64);
        ctx.ledger.record_error(reference, apply_error.to_string());
        return;
    };
    if !ctx.opts.replace_on_error {
        counter!("apply_err", 1u64);
        ctx.ledger.record_error(reference, apply_error.to_string());
        return;
    }
    ctx.reporter
        .warning(&reference.to_string(), "patching failed, retrying with replace instead of patch");

    let mut x2 = x.clone();
    if let Some(rv) = resource_version(remote) {
        let rv = rv.to_string();
        set_resource_version(&mut x2, &rv);
    }
    let (res, warnings) = ctx
        .client
        .update_object(&x2, UpdateOptions { force_dry_run: ctx.opts.dry_run })
        .await;
    ctx.ledger.record_api_warnings(reference, warnings);
    match res {
        Ok(applied) => {
            counter!("apply_ok", 1u64);
            ctx.ledger.record_result(applied, hook);
        }
        Err(e) => retry_force_replace(ctx, reference, x, hook, e).await,
    }
}

/// Last tier: delete and apply once more. The retry does not cascade back
/// through the ladder; its error is terminal.
async fn retry_force_replace(
    ctx: &ApplyContext,
    reference: &ObjectRef,
    x: &Value,
    hook: bool,
    update_error: ClientError,
) {
    if !ctx.opts.force_replace_on_error {
        counter!("apply_err", 1u64);
        ctx.ledger.record_error(reference, update_error.to_string());
        return;
    }
    ctx.reporter
        .warning(&reference.to_string(), "update failed, retrying by deleting and re-applying");

    if !delete_object(ctx, reference).await {
        return;
    }
    if ctx.opts.dry_run {
        // The deletion above was a dry run; the remote object still exists
        // and a dry-run apply might be rejected. Record the input instead.
        ctx.ledger.record_result(x.clone(), hook);
        return;
    }
    let opts = PatchOptions { force_dry_run: ctx.opts.dry_run, force_apply: false };
    let (res, warnings) = ctx.client.patch_object(x, opts).await;
    ctx.ledger.record_api_warnings(reference, warnings);
    match res {
        Ok(applied) => {
            counter!("apply_ok", 1u64);
            ctx.ledger.record_result(applied, hook);
        }
        Err(e) => {
            counter!("apply_err", 1u64);
            ctx.ledger.record_error(reference, e.to_string());
        }
    }
}

/// Delete an object, recording warnings and the deletion. An already-absent
/// object counts as deleted successfully.
pub(crate) async fn delete_object(ctx: &ApplyContext, reference: &ObjectRef) -> bool {
    let (res, warnings) = ctx
        .client
        .delete_object(reference, DeleteOptions { force_dry_run: ctx.opts.dry_run })
        .await;
    ctx.ledger.record_api_warnings(reference, warnings);
    match res {
        Ok(()) => {
            counter!("delete_ok", 1u64);
            ctx.ledger.record_deleted(reference);
            true
        }
        Err(ClientError::NotFound) => true,
        Err(e) => {
            ctx.ledger.record_error(reference, e.to_string());
            false
        }
    }
}
