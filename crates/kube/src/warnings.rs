//! API-warning capture: a tower layer that lifts HTTP `Warning:` headers off
//! responses into a shared sink, keyed by request path so callers can
//! attribute them to the object the call touched.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use http::{Request, Response};
use tower::{Layer, Service};

use crate::ApiWarning;

#[derive(Clone, Default)]
pub struct WarningSink {
    inner: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl WarningSink {
    fn push(&self, path: &str, text: String) {
        self.inner.lock().unwrap().entry(path.to_string()).or_default().push(text);
    }

    /// Take all warnings recorded for a request path.
    pub fn drain(&self, path: &str) -> Vec<ApiWarning> {
        self.inner
            .lock()
            .unwrap()
            .remove(path)
            .map(|v| v.into_iter().map(|text| ApiWarning { text }).collect())
            .unwrap_or_default()
    }
}

pub struct CaptureWarningsLayer {
    sink: WarningSink,
}

impl CaptureWarningsLayer {
    pub fn new(sink: WarningSink) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for CaptureWarningsLayer {
    type Service = CaptureWarnings<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureWarnings { inner, sink: self.sink.clone() }
    }
}

#[derive(Clone)]
pub struct CaptureWarnings<S> {
    inner: S,
    sink: WarningSink,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for CaptureWarnings<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqB>) -> Self::Future {
        let path = req.uri().path().to_string();
        let sink = self.sink.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            let resp = fut.await?;
            for val in resp.headers().get_all(http::header::WARNING) {
                if let Some(text) = val.to_str().ok().and_then(parse_warning_header) {
                    sink.push(&path, text);
                }
            }
            Ok(resp)
        })
    }
}

/// Parse an RFC 7234 warning header value: `<code> <agent> "<text>"`.
/// Kubernetes emits code 299 with agent `-`.
fn parse_warning_header(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, ' ');
    let code = parts.next()?;
    if code != "299" {
        return None;
    }
    let _agent = parts.next()?;
    let rest = parts.next()?.trim();
    let rest = rest.strip_prefix('"').unwrap_or(rest);
    let rest = rest.strip_suffix('"').unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    Some(rest.replace("\\\"", "\""))
}
