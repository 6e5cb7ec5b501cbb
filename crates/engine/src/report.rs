//! Injected status reporting. The engine never writes run progress to a
//! global logger directly; frontends decide how progress lines render.

use tracing::{info, warn};

pub trait StatusReporter: Send + Sync {
    fn info(&self, scope: &str, message: &str);
    fn warning(&self, scope: &str, message: &str);
}

/// Default reporter: progress lines become tracing events.
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn info(&self, scope: &str, message: &str) {
        info!(scope = %scope, "{message}");
    }

    fn warning(&self, scope: &str, message: &str) {
        warn!(scope = %scope, "{message}");
    }
}
