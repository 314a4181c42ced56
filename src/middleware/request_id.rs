//! Request correlation middleware.
//!
//! # Features
//!
//! - Reuses a client-supplied `X-Request-Id` (trimmed, when non-empty)
//! - Generates a UUIDv4 otherwise
//! - Creates the per-request [`RequestContext`] in request extensions
//! - Adds `X-Request-Id` to every response that passes back through it
//! - Runs the rest of the pipeline inside a `request` span carrying the id
//!
//! # Client Usage
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:4001/api/produtos
//! ```
//!
//! The same ID is returned in the response and in any error body.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::header::HeaderValue;
use axum::http::request::Parts;
use axum::http::{Request, Response};
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Fallback header value when request ID parsing fails.
static UNKNOWN_REQUEST_ID: HeaderValue = HeaderValue::from_static("unknown");

/// Per-request record shared by the middlewares and handlers of one request.
///
/// Cheap to clone; all clones observe the same `timed_out` flag.
#[derive(Debug, Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    correlation_id: String,
    received_at: DateTime<Utc>,
    started: Instant,
    timed_out: AtomicBool,
}

impl RequestContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                correlation_id: correlation_id.into(),
                received_at: Utc::now(),
                started: Instant::now(),
                timed_out: AtomicBool::new(false),
            }),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.inner.correlation_id
    }

    /// Wall-clock time the request entered the pipeline.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.inner.received_at
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Whether the timeout guard already answered this request with a 503.
    ///
    /// Downstream work that keeps running after a timeout can check this to
    /// stop early.
    pub fn is_timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::Acquire)
    }

    pub(crate) fn mark_timed_out(&self) {
        self.inner.timed_out.store(true, Ordering::Release);
    }
}

/// Handlers can take the context as an extractor.
///
/// When the request ID layer is not installed a fresh context is created, so
/// extraction never fails.
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_else(|| RequestContext::new(Uuid::new_v4().to_string())))
    }
}

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    /// Create a new request ID layer.
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = extract_or_generate_request_id(&req);
        let header_value =
            HeaderValue::from_str(&request_id).unwrap_or_else(|_| UNKNOWN_REQUEST_ID.clone());

        // Normalized id visible to handlers both as header and as context
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());
        req.extensions_mut()
            .insert(RequestContext::new(request_id.clone()));

        let span = info_span!("request", request_id = %request_id);
        debug!(parent: &span, method = %req.method(), path = %req.uri().path(), "Processing request");

        let mut inner = self.inner.clone();

        Box::pin(
            async move {
                let mut response = inner.call(req).await?;
                response
                    .headers_mut()
                    .insert(REQUEST_ID_HEADER, header_value);
                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// Extract the request ID from headers or generate a new one.
///
/// Surrounding whitespace is dropped; a blank header counts as absent.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> String {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
    {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    Uuid::new_v4().to_string()
}

/// Extension trait to read the correlation id from requests.
pub trait RequestIdExt {
    /// Correlation id assigned by [`RequestIdLayer`], if the layer ran.
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions()
            .get::<RequestContext>()
            .map(RequestContext::correlation_id)
    }
}
