//! # Padaria Backend
//!
//! HTTP request pipeline for the bakery delivery system: everything a
//! request passes through before and after the business handlers, plus the
//! daily delivery generation trigger.
//!
//! - **CORS**: Development origins and ngrok tunnels, one policy for
//!   preflight and actual requests
//! - **Protection**: Per-IP rate limiting, security headers, body limits
//! - **Correlation**: `X-Request-Id` on every response and error body
//! - **Resilience**: Timeout fallback, uniform error envelope, caught panics
//! - **Scheduling**: Delivery generation at boot and daily at midnight
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (CORS → Rate Limit → Request ID → Timeout → …)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  GET /  ·  /api/* modules (ApiModules)  ·  404 fallback     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  AppState (config, rate-limit store, DailyJob)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use padaria_backend::{ApiModules, AppState, Config, TaskRegistry, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!
//!     let mut registry = TaskRegistry::new();
//!     registry.register("gerarEntregasDoDia", || async { Ok(()) });
//!
//!     let state = AppState::new(config, &registry)?;
//!     let app = build_router(state, ApiModules::new())?;
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::{Config, Environment};
pub use error::{AppError, AppResult};
pub use jobs::{DailyJob, TaskRegistry};
pub use routes::{API_PREFIXES, ApiModules, build_router};
pub use state::AppState;
