//! HTTP middleware for the request lifecycle.
//!
//! - **CORS**: One origin policy for preflight and actual requests
//! - **Security headers**: Helmet-style response headers
//! - **Rate Limiting**: Fixed window per client IP over a pluggable store
//! - **Request ID**: Correlation id generation and propagation
//! - **Timeout Guard**: 503 fallback when a handler takes too long
//! - **Error Normalizer**: Uniform `{"erro", "requestId"}` error bodies
//!
//! # Architecture
//!
//! ```text
//! Request → CORS → Headers → Rate Limiter → Request ID → Timeout → Errors → Handler
//!            ↓                    ↓              ↓           ↓         ↓
//!        204 preflight      429 Too Many   X-Request-Id    503    error envelope
//! ```

pub mod cors;
pub mod errors;
pub mod ip;
pub mod origin;
pub mod rate_limit;
pub mod request_id;
pub mod security;
pub mod timeout;

pub use cors::{ALLOWED_METHODS, CorsLayer, DEFAULT_ALLOWED_HEADERS};
pub use errors::{ErrorPolicy, normalize_errors};
pub use ip::{ProxyTrust, UNKNOWN_IP, extract_client_ip};
pub use origin::{OriginDecision, OriginPolicy};
pub use rate_limit::{
    InMemoryStore, RATE_LIMIT_MESSAGE, RateLimitDecision, RateLimitError, RateLimitLayer,
    RateLimitStore,
};
pub use request_id::{REQUEST_ID_HEADER, RequestContext, RequestIdExt, RequestIdLayer};
pub use security::security_headers;
pub use timeout::{
    RequestDeadline, RequestDeadlineExt, TIMEOUT_MESSAGE, TimeoutGuardLayer, TimeoutTimer,
    TimerOutcome,
};
