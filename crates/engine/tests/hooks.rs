//! Hook lifecycle behavior: phase selection, weight ordering, delete
//! policies, readiness waits and their effect on the rest of the item.

mod common;

use std::time::Duration;

use common::*;
use rudder_core::ApplyOptions;
use serde_json::json;

fn pending_job_status() -> serde_json::Value {
    json!({"conditions": [{"type": "Complete", "status": "False"}]})
}

fn failed_job_status(msg: &str) -> serde_json::Value {
    json!({"conditions": [{"type": "Failed", "status": "True", "message": msg}]})
}

#[tokio::test]
async fn hooks_run_in_weight_order_before_regular_objects() {
    let cluster = FakeCluster::new();
    let coll = collection(vec![item(
        "app",
        false,
        vec![
            cm("cm1", "ns1", json!({"a": "1"})),
            job_hook("late", "ns1", "pre-deploy", Some(5), None),
            job_hook("early", "ns1", "pre-deploy", Some(-1), None),
        ],
    )]);
    let res = run(&cluster, &coll, fast_opts()).await;
    assert!(res.errors.is_empty(), "{:?}", res.errors);

    let mutations: Vec<_> = cluster
        .calls()
        .into_iter()
        .filter(|c| c.verb == "patch")
        .map(|c| c.reference.name.clone())
        .collect();
    assert_eq!(mutations, vec!["early", "late", "cm1"]);

    // Each hook's readiness completed before the next hook was applied.
    let early_wait = cluster
        .calls_for(&job_ref("early", "ns1"))
        .into_iter()
        .find(|c| c.verb == "get")
        .expect("early hook was polled");
    let late_apply = &cluster.calls_for(&job_ref("late", "ns1"))[0];
    assert!(late_apply.started >= early_wait.finished);
}

#[tokio::test]
async fn hook_refs_never_land_in_the_regular_applied_map() {
    let cluster = FakeCluster::new();
    let coll = collection(vec![item(
        "app",
        false,
        vec![
            cm("cm1", "ns1", json!({"a": "1"})),
            job_hook("setup", "ns1", "pre-deploy", None, None),
        ],
    )]);
    let res = run(&cluster, &coll, fast_opts()).await;

    assert_eq!(res.hook_objects, vec![job_ref("setup", "ns1")]);
    assert_eq!(res.new_objects, vec![cm_ref("cm1", "ns1")]);
    assert!(!res.new_objects.contains(&job_ref("setup", "ns1")));
}

#[tokio::test]
async fn initial_deploy_selects_initial_phases() {
    let cluster = FakeCluster::new();
    let coll = collection(vec![item(
        "app",
        false,
        vec![
            cm("cm1", "ns1", json!({"a": "1"})),
            job_hook("only-initial", "ns1", "pre-deploy-initial", None, None),
            job_hook("only-upgrade", "ns1", "pre-deploy-upgrade", None, None),
        ],
    )]);

    // Fresh cluster: the initial hook runs, the upgrade hook does not.
    let res = run(&cluster, &coll, fast_opts()).await;
    assert!(res.errors.is_empty());
    assert_eq!(res.hook_objects, vec![job_ref("only-initial", "ns1")]);
    assert!(cluster.mutation_verbs_for(&job_ref("only-upgrade", "ns1")).is_empty());
}

#[tokio::test]
async fn upgrade_deploy_selects_upgrade_phases() {
    let cluster = FakeCluster::new();
    // A regular object already exists, so the item is an upgrade.
    cluster.seed(cm("cm1", "ns1", json!({"a": "0"})));
    let coll = collection(vec![item(
        "app",
        false,
        vec![
            cm("cm1", "ns1", json!({"a": "1"})),
            job_hook("only-initial", "ns1", "post-deploy-initial", None, None),
            job_hook("only-upgrade", "ns1", "post-deploy-upgrade", None, None),
        ],
    )]);

    let res = run(&cluster, &coll, fast_opts()).await;
    assert!(res.errors.is_empty());
    assert_eq!(res.hook_objects, vec![job_ref("only-upgrade", "ns1")]);
    assert!(cluster.mutation_verbs_for(&job_ref("only-initial", "ns1")).is_empty());
}

#[tokio::test]
async fn hook_timeout_records_error_and_skips_regular_objects() {
    let cluster = FakeCluster::new();
    let hook = job_ref("migrate", "ns1");
    cluster.set_status_after_apply(&hook, pending_job_status());

    let coll = collection(vec![item(
        "app",
        false,
        vec![
            job_hook("migrate", "ns1", "pre-deploy", None, None),
            cm("cm1", "ns1", json!({"a": "1"})),
        ],
    )]);
    let opts = ApplyOptions { hook_timeout: Duration::from_millis(60), ..fast_opts() };
    let res = run(&cluster, &coll, opts).await;

    let hook_errors: Vec<_> = res.errors.iter().filter(|e| e.reference == hook).collect();
    assert_eq!(hook_errors.len(), 1);
    assert!(hook_errors[0].message.contains("timed out"), "{}", hook_errors[0].message);
    assert!(cluster.mutation_verbs_for(&cm_ref("cm1", "ns1")).is_empty());
    assert!(res.new_objects.is_empty());
}

#[tokio::test]
async fn hook_validation_failure_fails_the_item() {
    let cluster = FakeCluster::new();
    let hook = job_ref("migrate", "ns1");
    cluster.set_status_after_apply(&hook, failed_job_status("exit code 1"));

    let coll = collection(vec![item(
        "app",
        false,
        vec![
            job_hook("migrate", "ns1", "pre-deploy", None, None),
            cm("cm1", "ns1", json!({"a": "1"})),
        ],
    )]);
    let res = run(&cluster, &coll, fast_opts()).await;

    assert_eq!(res.errors.len(), 1);
    assert!(res.errors[0].message.contains("exit code 1"));
    assert!(cluster.mutation_verbs_for(&cm_ref("cm1", "ns1")).is_empty());
}

#[tokio::test]
async fn hook_disappearing_mid_wait_fails() {
    let cluster = FakeCluster::new();
    let hook = job_ref("migrate", "ns1");
    // Applied object never lands in the fake store: simulate with a dry-run
    // style disappearance by deleting right after apply via policy "never"
    // and a pending status, then removing it out of band.
    cluster.set_status_after_apply(&hook, pending_job_status());

    let coll = collection(vec![item(
        "app",
        false,
        vec![job_hook("migrate", "ns1", "pre-deploy", None, None)],
    )]);

    let cluster2 = cluster.clone();
    let remover = tokio::spawn(async move {
        // Let the first poll see it pending, then make it vanish.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (res, _) = rudder_kube::ObjectClient::delete_object(
            cluster2.as_ref(),
            &job_ref("migrate", "ns1"),
            rudder_kube::DeleteOptions::default(),
        )
        .await;
        res.expect("delete");
    });

    let opts = ApplyOptions { hook_timeout: Duration::from_secs(5), ..fast_opts() };
    let res = run(&cluster, &coll, opts).await;
    remover.await.unwrap();

    assert_eq!(res.errors.len(), 1);
    assert!(
        res.errors[0].message.contains("disappeared"),
        "{}",
        res.errors[0].message
    );
}

#[tokio::test]
async fn before_hook_creation_deletes_leftover_hook_object() {
    let cluster = FakeCluster::new();
    // Leftover hook object and regular object from a previous run.
    cluster.seed(job_hook("migrate", "ns1", "pre-deploy", None, None));
    cluster.seed(cm("cm1", "ns1", json!({"a": "0"})));

    let coll = collection(vec![item(
        "app",
        false,
        vec![
            job_hook("migrate", "ns1", "pre-deploy", None, None),
            cm("cm1", "ns1", json!({"a": "1"})),
        ],
    )]);
    let res = run(&cluster, &coll, fast_opts()).await;
    assert!(res.errors.is_empty(), "{:?}", res.errors);

    let verbs = cluster.mutation_verbs_for(&job_ref("migrate", "ns1"));
    assert_eq!(verbs, vec!["delete", "patch"]);
    // Deleted then re-applied: not reported as deleted.
    assert!(res.deleted_objects.is_empty());
}

#[tokio::test]
async fn hook_succeeded_policy_deletes_after_readiness() {
    let cluster = FakeCluster::new();
    let coll = collection(vec![item(
        "app",
        false,
        vec![job_hook("migrate", "ns1", "pre-deploy", None, Some("hook-succeeded"))],
    )]);
    let res = run(&cluster, &coll, fast_opts()).await;
    assert!(res.errors.is_empty(), "{:?}", res.errors);

    let verbs = cluster.mutation_verbs_for(&job_ref("migrate", "ns1"));
    assert_eq!(verbs, vec!["patch", "delete"]);
    assert_eq!(res.deleted_objects, vec![job_ref("migrate", "ns1")]);
    // Applied-then-deleted: still visible as a hook object of the run.
    assert_eq!(res.hook_objects, vec![job_ref("migrate", "ns1")]);
    assert!(cluster.get(&job_ref("migrate", "ns1")).is_none());
}

#[tokio::test]
async fn hook_failed_policy_deletes_only_on_failure() {
    let cluster = FakeCluster::new();
    let hook = job_ref("migrate", "ns1");
    cluster.set_status_after_apply(&hook, failed_job_status("boom"));

    let coll = collection(vec![item(
        "app",
        false,
        vec![job_hook("migrate", "ns1", "pre-deploy", None, Some("hook-failed"))],
    )]);
    let res = run(&cluster, &coll, fast_opts()).await;

    assert_eq!(res.errors.len(), 1);
    let verbs = cluster.mutation_verbs_for(&hook);
    assert_eq!(verbs, vec!["patch", "delete"]);
    assert_eq!(res.deleted_objects, vec![hook]);
}

#[tokio::test]
async fn dry_run_skips_readiness_wait() {
    let cluster = FakeCluster::new();
    let hook = job_ref("migrate", "ns1");
    // Would never become ready; dry run must not wait on it.
    cluster.set_status_after_apply(&hook, pending_job_status());

    let coll = collection(vec![item(
        "app",
        false,
        vec![
            job_hook("migrate", "ns1", "pre-deploy", None, None),
            cm("cm1", "ns1", json!({"a": "1"})),
        ],
    )]);
    let opts = ApplyOptions { dry_run: true, hook_timeout: Duration::from_secs(30), ..fast_opts() };
    let res = run(&cluster, &coll, opts).await;

    assert!(res.errors.is_empty(), "{:?}", res.errors);
    // The hook was treated as ready and the regular object proceeded.
    assert_eq!(res.new_objects, vec![cm_ref("cm1", "ns1")]);
}

#[tokio::test]
async fn malformed_hook_annotation_records_error() {
    let cluster = FakeCluster::new();
    let coll = collection(vec![item(
        "app",
        false,
        vec![job_hook("bad", "ns1", "mid-deploy", None, None)],
    )]);
    let res = run(&cluster, &coll, fast_opts()).await;

    assert_eq!(res.errors.len(), 1);
    assert!(res.errors[0].message.contains("unknown hook phase"));
    assert!(cluster.mutation_verbs_for(&job_ref("bad", "ns1")).is_empty());
}

#[tokio::test]
async fn wait_readiness_polls_applied_objects() {
    let cluster = FakeCluster::new();
    let r = cm_ref("cm1", "ns1");
    let mut it = item("app", false, vec![cm("cm1", "ns1", json!({"a": "1"}))]);
    it.wait_readiness = true;
    let coll = collection(vec![it]);

    let res = run(&cluster, &coll, fast_opts()).await;
    assert!(res.errors.is_empty(), "{:?}", res.errors);
    // At least one readiness probe happened after the apply.
    let calls = cluster.calls_for(&r);
    let patch_pos = calls.iter().position(|c| c.verb == "patch").unwrap();
    assert!(
        calls.iter().skip(patch_pos + 1).any(|c| c.verb == "get"),
        "no readiness probe after apply"
    );
}
