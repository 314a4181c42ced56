//! Shared application state for Axum handlers.
//!
//! Holds the configuration, the rate-limit store, and the daily delivery
//! job, all behind `Arc` so the state is cheap to clone per request.
//!
//! # Structured Concurrency
//!
//! Background tasks (store sweeper, delivery schedule, job runs) are
//! managed using `tokio_util::task::TaskTracker` and `CancellationToken`.
//! Call `shutdown()` to stop them before application exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::jobs::{DailyJob, DailySchedule, TaskRegistry};
use crate::metrics;
use crate::middleware::rate_limit::{InMemoryStore, RateLimitStore};

/// Upper bound between two sweeps of expired rate-limit windows.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state for Axum handlers.
///
/// # Lifecycle
///
/// Background tasks are spawned when the state is created:
///
/// ```rust,ignore
/// let state = AppState::new(config, &registry)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Rate-limit store, `None` when rate limiting is disabled
    pub rate_limiter: Option<Arc<dyn RateLimitStore>>,
    /// Daily delivery job, `None` when its task could not be resolved
    pub delivery_job: Option<Arc<DailyJob>>,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create the state with the in-memory rate-limit store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for rate-limit or schedule settings
    /// that cannot be used.
    pub fn new(config: Config, registry: &TaskRegistry) -> AppResult<Self> {
        let store: Option<Arc<dyn RateLimitStore>> = if config.rate_limiting_enabled() {
            let store = InMemoryStore::new(config.rate_limit_max, config.rate_limit_window)
                .map_err(|e| AppError::ConfigError(e.to_string()))?;
            Some(Arc::new(store))
        } else {
            None
        };

        Self::with_rate_limiter(config, registry, store)
    }

    /// Create the state with a caller-supplied rate-limit store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the delivery schedule does not parse.
    pub fn with_rate_limiter(
        config: Config,
        registry: &TaskRegistry,
        rate_limiter: Option<Arc<dyn RateLimitStore>>,
    ) -> AppResult<Self> {
        let schedule = DailySchedule::parse(&config.delivery_job_cron)
            .map_err(|e| AppError::ConfigError(format!("Invalid DELIVERY_JOB_CRON: {e}")))?;

        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        let delivery_job = DailyJob::start(
            registry,
            &config.delivery_job_task,
            schedule,
            task_tracker.clone(),
            cancellation_token.clone(),
        );

        let state = Self {
            config: Arc::new(config),
            rate_limiter,
            delivery_job,
            started_at: Instant::now(),
            task_tracker,
            cancellation_token,
        };

        state.spawn_rate_limit_sweeper();

        Ok(state)
    }

    /// Periodically drop expired rate-limit windows so the store does not
    /// grow with every client ever seen.
    fn spawn_rate_limit_sweeper(&self) {
        let Some(store) = self.rate_limiter.clone() else {
            return;
        };
        let period = store.window().min(MAX_SWEEP_INTERVAL);
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Rate limit sweeper received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.purge_expired(tokio::time::Instant::now());
                        let tracked = store.tracked_clients();
                        metrics::set_rate_limit_tracked_clients(tracked);
                        trace!(removed, tracked, "Swept expired rate limit windows");
                    }
                }
            }

            debug!("Rate limit sweeper shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Signals cancellation, closes the tracker, and waits for every tracked
    /// task, including a delivery run that is still in flight.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
