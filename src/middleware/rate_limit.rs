//! Per-IP rate limiting with fixed windows.
//!
//! # Algorithm
//!
//! Each client IP owns a window `{count, window_start}`. A window starts at
//! the client's first request and lasts `window` (default 15 minutes);
//! boundaries are not aligned to the wall clock. Within a window at most
//! `max` requests (default 1000) are forwarded, later ones get 429 until the
//! window has elapsed, at which point the next request opens a fresh window.
//!
//! # Store
//!
//! Window state lives behind the [`RateLimitStore`] trait so deployments can
//! swap in a shared store and tests can reset it. [`InMemoryStore`] keeps the
//! windows in a sharded `DashMap`; each update holds the shard lock for that
//! key, so concurrent requests from one IP are counted exactly.
//!
//! # Response
//!
//! On rate limit exceeded (429):
//! - Body: `{"erro": "Muitas requisições vindas deste IP. Tente novamente mais tarde."}`
//! - `Retry-After`: Seconds until the client's window ends
//! - `X-RateLimit-Limit`: Configured maximum per window
//! - `X-RateLimit-Remaining`: Always `0`

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use dashmap::DashMap;
use serde_json::json;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::warn;

use super::ip::{ProxyTrust, extract_client_ip};
use crate::metrics;

/// Message returned to clients that exceeded their quota.
pub const RATE_LIMIT_MESSAGE: &str =
    "Muitas requisições vindas deste IP. Tente novamente mais tarde.";

/// Error type for rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// Maximum requests per window cannot be zero.
    ZeroMax,
    /// Window length cannot be zero.
    ZeroWindow,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroMax => write!(
                f,
                "maximum requests per window must be greater than 0; disable the limiter instead"
            ),
            RateLimitError::ZeroWindow => write!(f, "rate limit window must be greater than 0"),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32, resets_in: Duration },
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Counting state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub count: u32,
    pub window_start: Instant,
}

/// Storage for per-client window state.
pub trait RateLimitStore: Send + Sync + fmt::Debug {
    /// Count one request from `key` at `now`.
    fn hit(&self, key: &str, now: Instant) -> RateLimitDecision;

    /// Drop windows that ended before `now`. Returns how many were removed.
    fn purge_expired(&self, now: Instant) -> usize;

    /// Forget all state.
    fn reset(&self);

    /// Maximum requests per window.
    fn limit(&self) -> u32;

    /// Window length.
    fn window(&self) -> Duration;

    /// Number of clients with a stored window.
    fn tracked_clients(&self) -> usize;
}

/// Process-local store.
#[derive(Debug)]
pub struct InMemoryStore {
    max: u32,
    window: Duration,
    windows: DashMap<String, WindowState>,
}

impl InMemoryStore {
    /// # Errors
    ///
    /// Returns an error if `max` or `window` is zero.
    pub fn new(max: u32, window: Duration) -> Result<Self, RateLimitError> {
        if max == 0 {
            return Err(RateLimitError::ZeroMax);
        }
        if window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }

        Ok(Self {
            max,
            window,
            windows: DashMap::new(),
        })
    }

    /// Current state for `key`, if it has one.
    pub fn window_state(&self, key: &str) -> Option<WindowState> {
        self.windows.get(key).map(|state| *state)
    }
}

impl RateLimitStore for InMemoryStore {
    fn hit(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut state = self.windows.entry(key.to_owned()).or_insert(WindowState {
            count: 0,
            window_start: now,
        });

        let mut elapsed = now.saturating_duration_since(state.window_start);
        if elapsed >= self.window {
            state.count = 0;
            state.window_start = now;
            elapsed = Duration::ZERO;
        }

        let resets_in = self.window - elapsed;
        if state.count >= self.max {
            return RateLimitDecision::Limited {
                retry_after: resets_in,
            };
        }

        state.count += 1;
        RateLimitDecision::Allowed {
            remaining: self.max - state.count,
            resets_in,
        }
    }

    fn purge_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now.saturating_duration_since(state.window_start) < self.window);
        before.saturating_sub(self.windows.len())
    }

    fn reset(&self) {
        self.windows.clear();
    }

    fn limit(&self) -> u32 {
        self.max
    }

    fn window(&self) -> Duration {
        self.window
    }

    fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let store = Arc::new(InMemoryStore::new(1000, Duration::from_secs(900))?);
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(RateLimitLayer::new(store, ProxyTrust::new(1)));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    store: Arc<dyn RateLimitStore>,
    proxy_trust: ProxyTrust,
}

impl RateLimitLayer {
    pub fn new(store: Arc<dyn RateLimitStore>, proxy_trust: ProxyTrust) -> Self {
        Self { store, proxy_trust }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            store: self.store.clone(),
            proxy_trust: self.proxy_trust,
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    store: Arc<dyn RateLimitStore>,
    proxy_trust: ProxyTrust,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let client_ip = extract_client_ip(&req, self.proxy_trust);

        match self.store.hit(&client_ip, Instant::now()) {
            RateLimitDecision::Allowed { .. } => {
                let mut inner = self.inner.clone();
                Box::pin(async move { inner.call(req).await })
            }
            RateLimitDecision::Limited { retry_after } => {
                let retry_after = retry_after.as_secs().max(1);
                let limit = self.store.limit();

                warn!(
                    client_ip = %client_ip,
                    path = %req.uri().path(),
                    retry_after_secs = retry_after,
                    "Rate limit exceeded for IP"
                );
                metrics::record_rate_limited();

                let response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    [
                        ("Retry-After", retry_after.to_string()),
                        ("X-RateLimit-Limit", limit.to_string()),
                        ("X-RateLimit-Remaining", "0".to_string()),
                    ],
                    Json(json!({ "erro": RATE_LIMIT_MESSAGE })),
                )
                    .into_response();

                Box::pin(async move { Ok(response) })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    #[test]
    fn test_zero_max_returns_error() {
        assert!(matches!(
            InMemoryStore::new(0, WINDOW),
            Err(RateLimitError::ZeroMax)
        ));
    }

    #[test]
    fn test_zero_window_returns_error() {
        assert!(matches!(
            InMemoryStore::new(10, Duration::ZERO),
            Err(RateLimitError::ZeroWindow)
        ));
    }

    #[test]
    fn test_allows_up_to_max_then_limits() {
        let store = InMemoryStore::new(3, WINDOW).unwrap();
        let now = Instant::now();

        for expected_remaining in [2, 1, 0] {
            match store.hit("1.2.3.4", now) {
                RateLimitDecision::Allowed { remaining, .. } => {
                    assert_eq!(remaining, expected_remaining)
                }
                other => panic!("expected allowed, got {other:?}"),
            }
        }

        assert!(!store.hit("1.2.3.4", now).is_allowed());
        // Rejected requests do not push the count past the maximum
        assert_eq!(store.window_state("1.2.3.4").unwrap().count, 3);
    }

    #[test]
    fn test_clients_are_counted_separately() {
        let store = InMemoryStore::new(1, WINDOW).unwrap();
        let now = Instant::now();

        assert!(store.hit("10.0.0.1", now).is_allowed());
        assert!(store.hit("10.0.0.2", now).is_allowed());
        assert!(!store.hit("10.0.0.1", now).is_allowed());
    }

    #[test]
    fn test_window_resets_relative_to_first_request() {
        let store = InMemoryStore::new(2, WINDOW).unwrap();
        let start = Instant::now();

        assert!(store.hit("ip", start).is_allowed());
        assert!(store.hit("ip", start + Duration::from_secs(600)).is_allowed());
        assert!(!store.hit("ip", start + Duration::from_secs(899)).is_allowed());

        // 15 minutes after the first request, not after the last one
        let decision = store.hit("ip", start + WINDOW);
        assert_eq!(
            decision,
            RateLimitDecision::Allowed {
                remaining: 1,
                resets_in: WINDOW
            }
        );
        assert_eq!(
            store.window_state("ip").unwrap().window_start,
            start + WINDOW
        );
    }

    #[test]
    fn test_retry_after_counts_down_to_window_end() {
        let store = InMemoryStore::new(1, WINDOW).unwrap();
        let start = Instant::now();

        store.hit("ip", start);
        let decision = store.hit("ip", start + Duration::from_secs(300));

        assert_eq!(
            decision,
            RateLimitDecision::Limited {
                retry_after: Duration::from_secs(600)
            }
        );
    }

    #[test]
    fn test_purge_expired_and_reset() {
        let store = InMemoryStore::new(5, WINDOW).unwrap();
        let start = Instant::now();

        store.hit("old", start);
        store.hit("new", start + Duration::from_secs(800));

        assert_eq!(store.purge_expired(start + WINDOW), 1);
        assert!(store.window_state("old").is_none());
        assert_eq!(store.tracked_clients(), 1);

        store.reset();
        assert_eq!(store.tracked_clients(), 0);
    }

    #[test]
    fn test_concurrent_hits_are_counted_exactly() {
        let store = Arc::new(InMemoryStore::new(1000, WINDOW).unwrap());
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|_| store.hit("shared", now).is_allowed())
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 1000);
        assert_eq!(store.window_state("shared").unwrap().count, 1000);
    }
}
