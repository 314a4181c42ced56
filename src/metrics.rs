//! Prometheus metrics for the request pipeline and the delivery job.
//!
//! Metrics are exposed on a dedicated listener when `METRICS_PORT` is set.
//! Recording functions are cheap no-ops when no recorder is installed, so
//! middleware can call them unconditionally.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `padaria_rate_limited_total` - Requests rejected with 429
//! - `padaria_timeout_timers_total` - Per-request timers by outcome (label: outcome)
//! - `padaria_errors_total` - Normalized error responses (label: status)
//! - `padaria_delivery_job_runs_total` - Delivery job attempts (labels: trigger, outcome)
//!
//! ## Histograms
//! - `padaria_delivery_job_duration_seconds` - Duration of completed job runs
//!
//! ## Gauges
//! - `padaria_rate_limit_tracked_clients` - Client keys held by the rate limiter

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMITED_TOTAL: &str = "padaria_rate_limited_total";
    pub const TIMEOUT_TIMERS_TOTAL: &str = "padaria_timeout_timers_total";
    pub const ERRORS_TOTAL: &str = "padaria_errors_total";
    pub const DELIVERY_JOB_RUNS_TOTAL: &str = "padaria_delivery_job_runs_total";
    pub const DELIVERY_JOB_DURATION_SECONDS: &str = "padaria_delivery_job_duration_seconds";
    pub const RATE_LIMIT_TRACKED_CLIENTS: &str = "padaria_rate_limit_tracked_clients";
}

/// Initialize the Prometheus metrics exporter.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (address in use,
/// recorder already set).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::TIMEOUT_TIMERS_TOTAL,
        "Per-request timeout timers by outcome (fired, finished, closed)"
    );
    describe_counter!(
        names::ERRORS_TOTAL,
        "Total number of normalized error responses"
    );
    describe_counter!(
        names::DELIVERY_JOB_RUNS_TOTAL,
        "Daily delivery generation attempts"
    );
    describe_histogram!(
        names::DELIVERY_JOB_DURATION_SECONDS,
        "Daily delivery generation duration in seconds"
    );
    describe_gauge!(
        names::RATE_LIMIT_TRACKED_CLIENTS,
        "Client keys currently tracked by the rate limiter"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record a request rejected with 429.
pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

/// Record how a per-request timeout timer was settled.
pub fn record_timeout_timer_outcome(outcome: &str) {
    counter!(names::TIMEOUT_TIMERS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Record a normalized error response.
pub fn record_error(status: u16) {
    counter!(names::ERRORS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Record a delivery job attempt.
pub fn record_job_run(trigger: &str, outcome: &str) {
    counter!(names::DELIVERY_JOB_RUNS_TOTAL, "trigger" => trigger.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record how long a delivery job run took.
pub fn record_job_duration(duration_secs: f64) {
    histogram!(names::DELIVERY_JOB_DURATION_SECONDS).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Update the number of client keys held by the rate limiter.
pub fn set_rate_limit_tracked_clients(count: usize) {
    gauge!(names::RATE_LIMIT_TRACKED_CLIENTS).set(count as f64);
}
