//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │       CORS       │ ← OPTIONS answered here with 204
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Body limit      │ ← extractor limit (1 MiB)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Security headers │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-Id in and out
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Timeout Guard   │ ← 503 after threshold + grace
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Error Normalizer │ ← {"erro", "requestId", "stack"?}
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Body read bound  │ ← request body timeout
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Catch Panic    │
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `GET /` - greeting
//! - `/api/*` - business modules, mounted through [`ApiModules`]
//! - anything else, including a known path with the wrong method -
//!   404 `{"erro": "Rota não encontrada."}`

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self as axum_middleware, Next};
use axum::response::Response;
use axum::routing::get;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{AppError, AppResult, panic_response};
use crate::handlers;
use crate::middleware::{
    CorsLayer, ErrorPolicy, OriginPolicy, ProxyTrust, RateLimitLayer, RequestIdLayer,
    TimeoutGuardLayer, normalize_errors, security_headers,
};
use crate::state::AppState;

/// Every prefix a business module may be mounted under.
pub const API_PREFIXES: [&str; 20] = [
    "/api/login",
    "/api/token",
    "/api/rotas-split",
    "/api/usuarios",
    "/api/padarias",
    "/api/produtos",
    "/api/clientes",
    "/api/entregas",
    "/api/entregas-avulsas",
    "/api/dev",
    "/api/rotas",
    "/api/rota-entregador",
    "/api/analitico",
    "/api/config",
    "/api/gerente",
    "/api/admin",
    "/api/pagamentos",
    "/api/caixa",
    "/api/saldo-diario",
    "/api/teste-protegido",
];

/// Prefix whose hits are logged before reaching its module.
const ANALITICO_PREFIX: &str = "/api/analitico";

/// Business handler groups keyed by URL prefix.
///
/// ```rust,ignore
/// let modules = ApiModules::new()
///     .mount("/api/padarias", padarias::router())?
///     .mount("/api/entregas", entregas::router())?;
/// let app = build_router(state, modules)?;
/// ```
#[derive(Default)]
pub struct ApiModules {
    mounted: Vec<(&'static str, Router<AppState>)>,
}

impl ApiModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `router` under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `prefix` is not one of
    /// [`API_PREFIXES`] or is already mounted.
    pub fn mount(mut self, prefix: &str, router: Router<AppState>) -> AppResult<Self> {
        let Some(known) = API_PREFIXES.iter().copied().find(|p| *p == prefix) else {
            return Err(AppError::ConfigError(format!("Unknown API prefix: {prefix}")));
        };

        if self.is_mounted(known) {
            return Err(AppError::ConfigError(format!(
                "API prefix mounted twice: {prefix}"
            )));
        }

        self.mounted.push((known, router));
        Ok(self)
    }

    pub fn is_mounted(&self, prefix: &str) -> bool {
        self.mounted.iter().any(|(p, _)| *p == prefix)
    }

    pub fn mounted_prefixes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.mounted.iter().map(|(p, _)| *p)
    }

    pub fn unmounted_prefixes(&self) -> impl Iterator<Item = &'static str> + '_ {
        API_PREFIXES
            .iter()
            .copied()
            .filter(|p| !self.is_mounted(p))
    }
}

async fn log_analitico_hit(req: Request, next: Next) -> Response {
    info!(method = %req.method(), path = %req.uri().path(), "Analitico hit");
    next.run(req).await
}

/// Build the application router with all routes and middleware configured.
///
/// # Errors
///
/// Returns `AppError::ConfigError` if the CORS policy cannot be built.
pub fn build_router(state: AppState, modules: ApiModules) -> AppResult<Router> {
    let config = state.config.clone();

    let origin_policy = OriginPolicy::new(config.cors_allowed_origins.iter().cloned())
        .map_err(|e| AppError::ConfigError(format!("Invalid CORS origin pattern: {e}")))?;

    // =========================================================================
    // Build Router with Routes
    // =========================================================================
    let mut router = Router::new().route("/", get(handlers::greeting));

    for (prefix, module) in modules.mounted {
        let module = if prefix == ANALITICO_PREFIX {
            module.layer(axum_middleware::from_fn(log_analitico_hit))
        } else {
            module
        };
        router = router.nest(prefix, module);
    }

    // Wrong methods on known paths answer like unknown routes. Set after
    // nesting so module routes get it too.
    router = router
        .method_not_allowed_fallback(handlers::not_found)
        .fallback(handlers::not_found);

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Panics become 500 errors
    router = router.layer(CatchPanicLayer::custom(panic_response));

    // 2. Clients that stall while sending the body release the handler
    info!(
        timeout_ms = config.request_timeout.as_millis(),
        "Request body read timeout configured"
    );
    router = router.layer(RequestBodyTimeoutLayer::new(config.request_timeout));

    // 3. Error envelope with requestId and, outside production, stack
    let error_policy = ErrorPolicy::from_config(&config);
    info!(
        environment = %config.environment,
        expose_stack = error_policy.expose_stack,
        "Error normalizer configured"
    );
    router = router.layer(axum_middleware::from_fn_with_state(
        error_policy,
        normalize_errors,
    ));

    // 4. Timeout guard
    let timeout = TimeoutGuardLayer::new(config.request_timeout, config.request_timeout_grace);
    info!(
        threshold_ms = config.request_timeout.as_millis(),
        deadline_ms = timeout.deadline().as_millis(),
        "Request timeout configured"
    );
    router = router.layer(timeout);

    // 5. Request ID
    router = router.layer(RequestIdLayer::new());

    // 6. Rate Limiting (if enabled)
    if let Some(store) = state.rate_limiter.clone() {
        info!(
            max = store.limit(),
            window_secs = store.window().as_secs(),
            trusted_hops = config.trust_proxy_hops,
            "Rate limiting enabled"
        );
        router = router.layer(RateLimitLayer::new(
            store,
            ProxyTrust::new(config.trust_proxy_hops),
        ));
    } else {
        info!("Rate limiting disabled (RATE_LIMIT_MAX=0)");
    }

    // 7. Tracing
    router = router.layer(TraceLayer::new_for_http());

    // 8. Security headers
    router = router.layer(axum_middleware::from_fn(security_headers));

    // 9. Request body size limit
    info!(
        max_size_bytes = config.max_request_body_size,
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 10. CORS (outermost, so preflights skip everything else)
    router = router.layer(CorsLayer::new(origin_policy));

    Ok(router.with_state(state))
}
