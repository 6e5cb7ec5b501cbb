//! In-memory fake cluster implementing `ObjectClient`, with scripted
//! failures, latency injection and a call log for ordering assertions.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rudder_core::objects::{ref_from_object, resource_version};
use rudder_core::{ApplyOptions, DeploymentCollection, DeploymentItem, InclusionFilter, ObjectRef};
use rudder_engine::{run_deployment, CommandResult, TracingReporter};
use rudder_kube::{
    ApiWarning, CallResult, ClientError, ConflictStatus, DeleteOptions, ObjectClient, PatchOptions,
    UpdateOptions,
};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct CallRecord {
    pub verb: &'static str,
    pub reference: ObjectRef,
    pub started: Instant,
    pub finished: Instant,
    pub dry_run: bool,
    pub force: bool,
    pub rv_sent: Option<String>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectRef, Value>,
    rv: u64,
    calls: Vec<CallRecord>,
    patch_errors: HashMap<ObjectRef, VecDeque<ClientError>>,
    update_errors: HashMap<ObjectRef, VecDeque<ClientError>>,
    conflict_unless_forced: HashMap<ObjectRef, ConflictStatus>,
    latency: HashMap<ObjectRef, Duration>,
    status_after_apply: HashMap<ObjectRef, Value>,
    warnings_on_patch: HashMap<ObjectRef, Vec<ApiWarning>>,
}

#[derive(Default)]
pub struct FakeCluster {
    inner: Mutex<Inner>,
}

#[allow(dead_code)]
impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, obj: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.rv += 1;
        let mut obj = obj;
        obj["metadata"]["resourceVersion"] = json!(inner.rv.to_string());
        let reference = ref_from_object(&obj).expect("seed object with identity");
        inner.objects.insert(reference, obj);
    }

    pub fn script_patch_error(&self, reference: &ObjectRef, err: ClientError) {
        self.inner
            .lock()
            .unwrap()
            .patch_errors
            .entry(reference.clone())
            .or_default()
            .push_back(err);
    }

    pub fn script_update_error(&self, reference: &ObjectRef, err: ClientError) {
        self.inner
            .lock()
            .unwrap()
            .update_errors
            .entry(reference.clone())
            .or_default()
            .push_back(err);
    }

    pub fn set_conflict_unless_forced(&self, reference: &ObjectRef, status: ConflictStatus) {
        self.inner
            .lock()
            .unwrap()
            .conflict_unless_forced
            .insert(reference.clone(), status);
    }

    pub fn set_latency(&self, reference: &ObjectRef, latency: Duration) {
        self.inner.lock().unwrap().latency.insert(reference.clone(), latency);
    }

    pub fn set_status_after_apply(&self, reference: &ObjectRef, status: Value) {
        self.inner
            .lock()
            .unwrap()
            .status_after_apply
            .insert(reference.clone(), status);
    }

    pub fn set_warnings_on_patch(&self, reference: &ObjectRef, warnings: Vec<&str>) {
        self.inner.lock().unwrap().warnings_on_patch.insert(
            reference.clone(),
            warnings.into_iter().map(|w| ApiWarning { text: w.to_string() }).collect(),
        );
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, reference: &ObjectRef) -> Vec<CallRecord> {
        self.calls().into_iter().filter(|c| &c.reference == reference).collect()
    }

    pub fn mutation_verbs_for(&self, reference: &ObjectRef) -> Vec<&'static str> {
        self.calls_for(reference)
            .into_iter()
            .filter(|c| c.verb != "get")
            .map(|c| c.verb)
            .collect()
    }

    pub fn get(&self, reference: &ObjectRef) -> Option<Value> {
        self.inner.lock().unwrap().objects.get(reference).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    fn latency_for(&self, reference: &ObjectRef) -> Option<Duration> {
        self.inner.lock().unwrap().latency.get(reference).copied()
    }
}

#[async_trait]
impl ObjectClient for FakeCluster {
    async fn patch_object(&self, obj: &Value, opts: PatchOptions) -> CallResult<Value> {
        let reference = ref_from_object(obj).expect("patched object with identity");
        let started = Instant::now();
        if let Some(d) = self.latency_for(&reference) {
            tokio::time::sleep(d).await;
        }
        let mut inner = self.inner.lock().unwrap();
        let warnings = inner.warnings_on_patch.get(&reference).cloned().unwrap_or_default();
        let record = |inner: &mut Inner, rv_sent: Option<String>| {
            inner.calls.push(CallRecord {
                verb: "patch",
                reference: reference.clone(),
                started,
                finished: Instant::now(),
                dry_run: opts.force_dry_run,
                force: opts.force_apply,
                rv_sent,
            });
        };

        if let Some(e) = inner.patch_errors.get_mut(&reference).and_then(|q| q.pop_front()) {
            record(&mut inner, None);
            return (Err(e), warnings);
        }
        if !opts.force_apply {
            if let Some(status) = inner.conflict_unless_forced.get(&reference).cloned() {
                record(&mut inner, None);
                return (Err(ClientError::Conflict(status)), warnings);
            }
        }

        inner.rv += 1;
        let mut applied = obj.clone();
        applied["metadata"]["resourceVersion"] = json!(inner.rv.to_string());
        if let Some(status) = inner.status_after_apply.get(&reference).cloned() {
            applied["status"] = status;
        }
        if !opts.force_dry_run {
            inner.objects.insert(reference.clone(), applied.clone());
        }
        record(&mut inner, None);
        (Ok(applied), warnings)
    }

    async fn update_object(&self, obj: &Value, opts: UpdateOptions) -> CallResult<Value> {
        let reference = ref_from_object(obj).expect("updated object with identity");
        let started = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let rv_sent = resource_version(obj).map(|s| s.to_string());
        let record = |inner: &mut Inner| {
            inner.calls.push(CallRecord {
                verb: "update",
                reference: reference.clone(),
                started,
                finished: Instant::now(),
                dry_run: opts.force_dry_run,
                force: false,
                rv_sent: rv_sent.clone(),
            });
        };

        if let Some(e) = inner.update_errors.get_mut(&reference).and_then(|q| q.pop_front()) {
            record(&mut inner);
            return (Err(e), Vec::new());
        }
        if !inner.objects.contains_key(&reference) {
            record(&mut inner);
            return (Err(ClientError::NotFound), Vec::new());
        }
        inner.rv += 1;
        let mut applied = obj.clone();
        applied["metadata"]["resourceVersion"] = json!(inner.rv.to_string());
        if !opts.force_dry_run {
            inner.objects.insert(reference.clone(), applied.clone());
        }
        record(&mut inner);
        (Ok(applied), Vec::new())
    }

    async fn delete_object(&self, reference: &ObjectRef, opts: DeleteOptions) -> CallResult<()> {
        let started = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(CallRecord {
            verb: "delete",
            reference: reference.clone(),
            started,
            finished: Instant::now(),
            dry_run: opts.force_dry_run,
            force: false,
            rv_sent: None,
        });
        if !inner.objects.contains_key(reference) {
            return (Err(ClientError::NotFound), Vec::new());
        }
        if !opts.force_dry_run {
            inner.objects.remove(reference);
        }
        (Ok(()), Vec::new())
    }

    async fn get_object(&self, reference: &ObjectRef) -> CallResult<Option<Value>> {
        let started = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(CallRecord {
            verb: "get",
            reference: reference.clone(),
            started,
            finished: Instant::now(),
            dry_run: false,
            force: false,
            rv_sent: None,
        });
        (Ok(inner.objects.get(reference).cloned()), Vec::new())
    }

    async fn list_objects(
        &self,
        gvk_key: &str,
        namespace: Option<&str>,
        _label_selector: Option<&str>,
    ) -> CallResult<Vec<Value>> {
        let inner = self.inner.lock().unwrap();
        let out = inner
            .objects
            .iter()
            .filter(|(r, _)| r.gvk_key() == gvk_key)
            .filter(|(r, _)| namespace.is_none() || r.namespace.as_deref() == namespace)
            .map(|(_, v)| v.clone())
            .collect();
        (Ok(out), Vec::new())
    }
}

// ---- builders ----

#[allow(dead_code)]
pub fn cm(name: &str, ns: &str, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": ns},
        "data": data
    })
}

#[allow(dead_code)]
pub fn cm_ref(name: &str, ns: &str) -> ObjectRef {
    ObjectRef {
        group: String::new(),
        version: "v1".into(),
        kind: "ConfigMap".into(),
        namespace: Some(ns.into()),
        name: name.into(),
    }
}

#[allow(dead_code)]
pub fn job_hook(name: &str, ns: &str, phase: &str, weight: Option<i64>, policy: Option<&str>) -> Value {
    let mut annotations = serde_json::Map::new();
    annotations.insert("rudder.io/hook".into(), json!(phase));
    if let Some(w) = weight {
        annotations.insert("rudder.io/hook-weight".into(), json!(w.to_string()));
    }
    if let Some(p) = policy {
        annotations.insert("rudder.io/hook-delete-policy".into(), json!(p));
    }
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {"name": name, "namespace": ns, "annotations": annotations},
        "spec": {"template": {"spec": {"containers": [{"name": "main", "image": "task:1"}]}}}
    })
}

#[allow(dead_code)]
pub fn job_ref(name: &str, ns: &str) -> ObjectRef {
    ObjectRef {
        group: "batch".into(),
        version: "v1".into(),
        kind: "Job".into(),
        namespace: Some(ns.into()),
        name: name.into(),
    }
}

#[allow(dead_code)]
pub fn item(path: &str, barrier: bool, objects: Vec<Value>) -> DeploymentItem {
    DeploymentItem {
        path: path.to_string(),
        tags: BTreeSet::new(),
        barrier,
        wait_readiness: false,
        objects,
    }
}

#[allow(dead_code)]
pub fn collection(items: Vec<DeploymentItem>) -> DeploymentCollection {
    DeploymentCollection { items, ..Default::default() }
}

/// Options with a fast poll cadence so readiness tests run in milliseconds.
#[allow(dead_code)]
pub fn fast_opts() -> ApplyOptions {
    ApplyOptions { hook_poll_interval: Duration::from_millis(10), ..Default::default() }
}

#[allow(dead_code)]
pub async fn run(
    cluster: &Arc<FakeCluster>,
    coll: &DeploymentCollection,
    opts: ApplyOptions,
) -> CommandResult {
    run_deployment(
        cluster.clone(),
        coll,
        opts,
        &InclusionFilter::default(),
        Arc::new(TracingReporter),
        "test-project",
    )
    .await
}
