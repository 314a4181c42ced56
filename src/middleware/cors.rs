//! CORS middleware driven by a single [`OriginPolicy`].
//!
//! One decision per request covers both preflight and actual requests, so a
//! browser can never be told "yes" on `OPTIONS` and "no" on the request that
//! follows.
//!
//! # Preflight (`OPTIONS`)
//!
//! Answered immediately with `204 No Content`, before rate limiting or
//! routing. For allowed origins the response reflects the origin and lists
//! the allowed methods; `Access-Control-Allow-Headers` echoes the client's
//! `Access-Control-Request-Headers` verbatim, or the default list when absent.
//! Denied origins get the 204 without any `Access-Control-Allow-*` headers,
//! which the browser treats as a refusal.
//!
//! # Actual requests
//!
//! Forwarded unchanged; on the way back the response gets `Vary: Origin` and,
//! when the origin was allowed, the reflected origin plus the method and
//! header lists. Credentials are never allowed.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_REQUEST_HEADERS, HeaderMap, HeaderValue, ORIGIN, VARY,
};
use axum::http::{Method, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::debug;

use super::origin::{OriginDecision, OriginPolicy};

/// Methods advertised to allowed origins.
pub const ALLOWED_METHODS: &str = "GET,POST,PUT,PATCH,DELETE,OPTIONS";

/// Headers advertised when the preflight does not name any.
pub const DEFAULT_ALLOWED_HEADERS: &str = "Content-Type, Authorization, ngrok-skip-browser-warning";

static ALLOWED_METHODS_VALUE: HeaderValue = HeaderValue::from_static(ALLOWED_METHODS);
static DEFAULT_ALLOWED_HEADERS_VALUE: HeaderValue =
    HeaderValue::from_static(DEFAULT_ALLOWED_HEADERS);
static VARY_ORIGIN: HeaderValue = HeaderValue::from_static("Origin");

/// CORS layer for Tower middleware stack.
#[derive(Clone)]
pub struct CorsLayer {
    policy: Arc<OriginPolicy>,
}

impl CorsLayer {
    pub fn new(policy: OriginPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = CorsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorsService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// CORS service wrapper.
#[derive(Clone)]
pub struct CorsService<S> {
    inner: S,
    policy: Arc<OriginPolicy>,
}

impl<S> Service<Request<Body>> for CorsService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let decision = evaluate_request(&self.policy, req.headers());

        if req.method() == Method::OPTIONS {
            let requested_headers = req.headers().get(ACCESS_CONTROL_REQUEST_HEADERS).cloned();
            debug!(
                path = %req.uri().path(),
                allowed = decision.is_allowed(),
                "Answering CORS preflight"
            );
            let response = preflight_response(&decision, requested_headers);
            return Box::pin(async move { Ok(response) });
        }

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            apply_cors_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

/// Evaluate the request's `Origin` header. A header that is not valid UTF-8
/// cannot match any allowed origin and is denied.
fn evaluate_request(policy: &OriginPolicy, headers: &HeaderMap) -> OriginDecision {
    match headers.get(ORIGIN).map(HeaderValue::to_str) {
        None => policy.evaluate(None),
        Some(Ok(origin)) => policy.evaluate(Some(origin)),
        Some(Err(_)) => OriginDecision::Denied,
    }
}

fn preflight_response(
    decision: &OriginDecision,
    requested_headers: Option<HeaderValue>,
) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;

    let headers = response.headers_mut();
    headers.append(VARY, VARY_ORIGIN.clone());

    if decision.is_allowed() {
        reflect_origin(headers, decision);
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS_VALUE.clone());
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            requested_headers
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_ALLOWED_HEADERS_VALUE.clone()),
        );
    }

    response
}

fn apply_cors_headers(headers: &mut HeaderMap, decision: &OriginDecision) {
    headers.append(VARY, VARY_ORIGIN.clone());

    if decision.reflected_origin().is_some() {
        reflect_origin(headers, decision);
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS_VALUE.clone());
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            DEFAULT_ALLOWED_HEADERS_VALUE.clone(),
        );
    }
}

fn reflect_origin(headers: &mut HeaderMap, decision: &OriginDecision) {
    if let Some(origin) = decision.reflected_origin()
        && let Ok(value) = HeaderValue::from_str(origin)
    {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn allowed(origin: &str) -> OriginDecision {
        OriginDecision::Allowed(origin.to_string())
    }

    #[test]
    fn test_preflight_echoes_requested_headers() {
        let response = preflight_response(
            &allowed("https://loja.ngrok-free.app"),
            Some(HeaderValue::from_static("x-custom, content-type")),
        );

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(
            headers[ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://loja.ngrok-free.app"
        );
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], "x-custom, content-type");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
        assert_eq!(headers[VARY], "Origin");
    }

    #[test]
    fn test_preflight_falls_back_to_default_headers() {
        let response = preflight_response(&allowed("http://localhost:5173"), None);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_HEADERS],
            DEFAULT_ALLOWED_HEADERS
        );
    }

    #[test]
    fn test_denied_preflight_has_no_allow_headers() {
        let response = preflight_response(
            &OriginDecision::Denied,
            Some(HeaderValue::from_static("content-type")),
        );

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_HEADERS).is_none());
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_METHODS).is_none());
    }

    #[test]
    fn test_preflight_without_origin_never_uses_wildcard() {
        let response = preflight_response(&OriginDecision::Absent, None);

        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_METHODS],
            ALLOWED_METHODS
        );
    }

    #[test]
    fn test_actual_response_keeps_existing_vary() {
        let mut headers = HeaderMap::new();
        headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));

        apply_cors_headers(&mut headers, &allowed("http://127.0.0.1:5173"));

        let vary: Vec<_> = headers.get_all(VARY).iter().collect();
        assert_eq!(vary, ["Accept-Encoding", "Origin"]);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "http://127.0.0.1:5173");
        assert!(headers.get("access-control-allow-credentials").is_none());
    }

    #[test]
    fn test_non_utf8_origin_is_denied() {
        let policy = OriginPolicy::new(["http://localhost:5173"]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_bytes(b"http://\xffhost").unwrap());

        assert_eq!(evaluate_request(&policy, &headers), OriginDecision::Denied);
    }
}
