//! The deployment scheduler: walks the collection in declared order,
//! dispatches each item's regular objects into a bounded worker pool, honors
//! barriers and the abort signal, and runs hook phases around each item.

use std::sync::Arc;

use rudder_core::objects::ref_from_object;
use rudder_core::{DeploymentCollection, DeploymentItem, InclusionFilter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::apply::apply_object;
use crate::hooks::{self, HookPhase};
use crate::ApplyContext;

/// Bounded pool size shared by all items of a run. Small and fixed so the
/// API server is not overwhelmed; collapse it to 1 via the env knob when
/// single-stepping.
fn apply_workers() -> usize {
    std::env::var("RUDDER_APPLY_WORKERS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(16)
}

pub async fn apply_collection(
    ctx: Arc<ApplyContext>,
    collection: &DeploymentCollection,
    inclusion: &InclusionFilter,
) {
    ctx.reporter.info("deploy", "running server-side apply for all objects");

    let pool = Arc::new(Semaphore::new(apply_workers()));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut previous_was_barrier = false;

    for item in &collection.items {
        if ctx.ledger.abort_requested() {
            ctx.reporter.warning("deploy", "aborting deployment due to errors");
            break;
        }
        if previous_was_barrier {
            ctx.reporter.info("deploy", "waiting on barrier...");
            while in_flight.join_next().await.is_some() {}
        }
        previous_was_barrier = item.barrier;

        if !inclusion.includes(item) {
            ctx.reporter.info(&item.path, "skipping");
            continue;
        }

        let ctx = ctx.clone();
        let item = item.clone();
        let pool = pool.clone();
        in_flight.spawn(async move { apply_item(ctx, item, pool).await });
    }

    while in_flight.join_next().await.is_some() {}
}

/// One item: pre phase (serial, blocking), regular objects on the pool,
/// optional readiness wait, post phase. A failed pre phase skips the rest of
/// the item.
async fn apply_item(ctx: Arc<ApplyContext>, item: DeploymentItem, pool: Arc<Semaphore>) {
    let mut hooks = Vec::new();
    let mut regular = Vec::new();
    for obj in &item.objects {
        match hooks::classify_hook(obj) {
            Ok(Some(h)) => hooks.push(h),
            Ok(None) => regular.push(obj.clone()),
            Err(e) => {
                if let Ok(reference) = ref_from_object(obj) {
                    ctx.ledger.record_error(&reference, e.to_string());
                }
            }
        }
    }

    // An item is an initial deploy iff none of its regular objects exist on
    // the cluster.
    let initial = regular
        .iter()
        .all(|o| ref_from_object(o).map(|r| !ctx.cache.contains(&r)).unwrap_or(true));
    debug!(path = %item.path, initial, objects = regular.len(), hooks = hooks.len(), "deploying item");

    if !hooks::run_hooks(&ctx, &item.path, &hooks, HookPhase::pre(initial)).await {
        ctx.reporter.warning(&item.path, "pre-deploy hooks failed, skipping item");
        return;
    }

    ctx.reporter.info(&item.path, &format!("applying {} objects", regular.len()));
    let mut tasks: JoinSet<()> = JoinSet::new();
    for obj in regular.iter().cloned() {
        let Ok(permit) = pool.clone().acquire_owned().await else {
            return;
        };
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let _permit = permit;
            apply_object(&ctx, &obj, false, false).await;
        });
    }
    while tasks.join_next().await.is_some() {}

    if item.wait_readiness && !ctx.opts.dry_run {
        for obj in &regular {
            let Ok(reference) = ref_from_object(obj) else { continue };
            if ctx.ledger.was_applied(&reference) && !ctx.ledger.has_error(&reference) {
                hooks::wait_ready(&ctx, &reference, "object").await;
            }
        }
    }

    hooks::run_hooks(&ctx, &item.path, &hooks, HookPhase::post(initial)).await;
}
