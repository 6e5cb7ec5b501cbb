//! Pre-run snapshot of remote cluster state, keyed by object reference.
//! Populated once before apply, read-only afterwards.

use std::collections::HashMap;

use futures::{stream, StreamExt};
use rudder_core::ObjectRef;
use rudder_kube::{ClientError, ObjectClient};
use serde_json::Value;
use tracing::debug;

use crate::ledger::Ledger;

const FETCH_CONCURRENCY: usize = 8;

#[derive(Default)]
pub struct RemoteObjects {
    map: HashMap<ObjectRef, Value>,
}

impl RemoteObjects {
    /// Fetch the current state of every reference. Absent objects and kinds
    /// the cluster does not know yet (a CRD applied later in the same run)
    /// are simply "not found"; other fetch failures become warnings and the
    /// apply itself surfaces anything real.
    pub async fn fetch(client: &dyn ObjectClient, refs: &[ObjectRef], ledger: &Ledger) -> Self {
        let results = stream::iter(refs.iter().cloned())
            .map(|r| async move {
                let (res, warnings) = client.get_object(&r).await;
                (r, res, warnings)
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut map = HashMap::new();
        for (reference, res, warnings) in results {
            ledger.record_api_warnings(&reference, warnings);
            match res {
                Ok(Some(obj)) => {
                    map.insert(reference, obj);
                }
                Ok(None) | Err(ClientError::NotFound) | Err(ClientError::NoKindMatch(_)) => {}
                Err(e) => {
                    ledger.record_warning(&reference, format!("fetching remote object failed: {e}"));
                }
            }
        }
        debug!(known = map.len(), total = refs.len(), "remote object cache populated");
        Self { map }
    }

    pub fn get(&self, reference: &ObjectRef) -> Option<&Value> {
        self.map.get(reference)
    }

    pub fn contains(&self, reference: &ObjectRef) -> bool {
        self.map.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
