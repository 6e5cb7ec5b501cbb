//! Rudder engine: the concurrent, dependency-ordered server-side-apply
//! pipeline. Takes a finalized deployment collection and drives it to
//! convergence on a live cluster: barriers for ordering, a patch → conflict
//! resolve → update → delete-and-recreate ladder per object, synchronous
//! lifecycle hooks with readiness polling, and a per-run ledger merging
//! results, warnings and errors under concurrent writers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use rudder_core::{ApplyOptions, DeploymentCollection, InclusionFilter};
use rudder_kube::ObjectClient;
use uuid::Uuid;

pub mod apply;
pub mod cache;
pub mod conflict;
pub mod hooks;
pub mod ledger;
pub mod report;
pub mod result;
pub mod scheduler;

pub use ledger::Ledger;
pub use report::{StatusReporter, TracingReporter};
pub use result::{ChangedObject, CommandResult, DiffSummary, ResultEntry};

/// Shared state of one run. Cheap to clone via `Arc`; the ledger is the only
/// mutable part and is internally synchronized.
pub struct ApplyContext {
    pub client: Arc<dyn ObjectClient>,
    pub opts: ApplyOptions,
    pub ledger: Ledger,
    pub cache: cache::RemoteObjects,
    pub reporter: Arc<dyn StatusReporter>,
}

/// Run the apply pipeline over a collection and assemble the command result.
///
/// Errors never cross this boundary: every failure is recorded on its object
/// reference in the ledger and shows up in the returned result. Partial
/// success is a first-class outcome.
pub async fn run_deployment(
    client: Arc<dyn ObjectClient>,
    collection: &DeploymentCollection,
    opts: ApplyOptions,
    inclusion: &InclusionFilter,
    reporter: Arc<dyn StatusReporter>,
    project: &str,
) -> CommandResult {
    let started_at = Utc::now();
    let ledger = Ledger::new(opts.abort_on_error);
    let refs = collection.all_refs();
    let cache = cache::RemoteObjects::fetch(client.as_ref(), &refs, &ledger).await;

    let ctx = Arc::new(ApplyContext { client, opts, ledger, cache, reporter });
    scheduler::apply_collection(ctx.clone(), collection, inclusion).await;

    result::assemble(
        &ctx,
        collection,
        Uuid::new_v4().to_string(),
        project.to_string(),
        started_at,
    )
}
