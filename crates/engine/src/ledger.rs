//! Per-run ledger: the two applied maps, the error/warning records and the
//! abort signal, all behind one mutex. Contention is low — apply latency
//! dominates — so coarse granularity is fine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use rudder_core::objects::ref_from_object;
use rudder_core::ObjectRef;
use rudder_kube::ApiWarning;
use serde_json::Value;
use tracing::warn;

#[derive(Default)]
struct LedgerInner {
    applied: BTreeMap<ObjectRef, Value>,
    applied_hooks: BTreeMap<ObjectRef, Value>,
    errors: BTreeMap<ObjectRef, Vec<String>>,
    warnings: BTreeMap<ObjectRef, Vec<String>>,
    deleted: BTreeSet<ObjectRef>,
    abort: bool,
}

/// Read-only copy of the ledger for result assembly.
#[derive(Default)]
pub struct LedgerSnapshot {
    pub applied: BTreeMap<ObjectRef, Value>,
    pub applied_hooks: BTreeMap<ObjectRef, Value>,
    pub errors: BTreeMap<ObjectRef, Vec<String>>,
    pub warnings: BTreeMap<ObjectRef, Vec<String>>,
    pub deleted: BTreeSet<ObjectRef>,
}

pub struct Ledger {
    abort_on_error: bool,
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    pub fn new(abort_on_error: bool) -> Self {
        Self { abort_on_error, inner: Mutex::new(LedgerInner::default()) }
    }

    /// Record a successfully applied object under its reference. A reference
    /// lives in exactly one of the two maps, selected by `hook`. Re-applying
    /// clears a previously recorded deletion of the same reference.
    pub fn record_result(&self, applied: Value, hook: bool) {
        let reference = match ref_from_object(&applied) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "applied object without identity, dropping result");
                return;
            }
        };
        let mut inner = self.inner.lock().unwrap();
        inner.deleted.remove(&reference);
        if hook {
            inner.applied_hooks.insert(reference, applied);
        } else {
            inner.applied.insert(reference, applied);
        }
    }

    /// Record an error for a reference. Flips the abort signal in the same
    /// critical section when the run is abort-on-error.
    pub fn record_error(&self, reference: &ObjectRef, message: impl Into<String>) {
        let message = message.into();
        warn!(reference = %reference, error = %message, "recorded error");
        let mut inner = self.inner.lock().unwrap();
        if self.abort_on_error {
            inner.abort = true;
        }
        inner.errors.entry(reference.clone()).or_default().push(message);
    }

    pub fn record_warning(&self, reference: &ObjectRef, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.warnings.entry(reference.clone()).or_default().push(message.into());
    }

    pub fn record_api_warnings(&self, reference: &ObjectRef, warnings: Vec<ApiWarning>) {
        if warnings.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.warnings.entry(reference.clone()).or_default();
        entry.extend(warnings.into_iter().map(|w| w.text));
    }

    pub fn record_deleted(&self, reference: &ObjectRef) {
        self.inner.lock().unwrap().deleted.insert(reference.clone());
    }

    pub fn has_error(&self, reference: &ObjectRef) -> bool {
        self.inner.lock().unwrap().errors.contains_key(reference)
    }

    pub fn was_applied(&self, reference: &ObjectRef) -> bool {
        self.inner.lock().unwrap().applied.contains_key(reference)
    }

    pub fn abort_requested(&self) -> bool {
        self.inner.lock().unwrap().abort
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.inner.lock().unwrap();
        LedgerSnapshot {
            applied: inner.applied.clone(),
            applied_hooks: inner.applied_hooks.clone(),
            errors: inner.errors.clone(),
            warnings: inner.warnings.clone(),
            deleted: inner.deleted.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reference(name: &str) -> ObjectRef {
        ObjectRef {
            group: String::new(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
            namespace: Some("ns".into()),
            name: name.into(),
        }
    }

    fn obj(name: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}})
    }

    #[test]
    fn results_split_by_hook_flag() {
        let l = Ledger::new(false);
        l.record_result(obj("a"), false);
        l.record_result(obj("b"), true);
        let s = l.snapshot();
        assert!(s.applied.contains_key(&reference("a")));
        assert!(!s.applied_hooks.contains_key(&reference("a")));
        assert!(s.applied_hooks.contains_key(&reference("b")));
        assert!(!s.applied.contains_key(&reference("b")));
    }

    #[test]
    fn error_sets_abort_only_when_configured() {
        let l = Ledger::new(false);
        l.record_error(&reference("a"), "boom");
        assert!(l.has_error(&reference("a")));
        assert!(!l.abort_requested());

        let l = Ledger::new(true);
        l.record_warning(&reference("a"), "just a warning");
        assert!(!l.abort_requested());
        l.record_error(&reference("a"), "boom");
        assert!(l.abort_requested());
    }

    #[test]
    fn reapply_clears_deletion() {
        let l = Ledger::new(false);
        l.record_deleted(&reference("a"));
        assert!(l.snapshot().deleted.contains(&reference("a")));
        l.record_result(obj("a"), false);
        assert!(!l.snapshot().deleted.contains(&reference("a")));
    }

    #[test]
    fn messages_preserve_insertion_order() {
        let l = Ledger::new(false);
        let r = reference("a");
        l.record_error(&r, "first");
        l.record_error(&r, "second");
        l.record_api_warnings(&r, vec![ApiWarning { text: "w1".into() }, ApiWarning { text: "w2".into() }]);
        let s = l.snapshot();
        assert_eq!(s.errors[&r], vec!["first", "second"]);
        assert_eq!(s.warnings[&r], vec!["w1", "w2"]);
    }
}
