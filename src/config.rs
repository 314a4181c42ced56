//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults that
//! match a local development setup. In production, configure via environment
//! variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `NODE_ENV`: `production` hides stack traces from error responses
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated list of exact-match origins
//!   (ngrok tunnels are always accepted by the origin policy)
//! - `TRUST_PROXY_HOPS`: Number of reverse proxies trusted for `X-Forwarded-For`
//!
//! # Request Limits
//!
//! - `RATE_LIMIT_MAX`: Requests per window per client IP (default: 1000, 0 = off)
//! - `RATE_LIMIT_WINDOW_SECS`: Window length (default: 900)
//! - `REQUEST_TIMEOUT_MS`: Processing threshold (default: 30000)
//! - `REQUEST_TIMEOUT_GRACE_MS`: Extra time before the fallback 503 (default: 500)
//! - `MAX_REQUEST_BODY_SIZE`: Body limit in bytes (default: 1 MiB)

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::jobs::DailySchedule;

/// Deployment environment, decided once at startup.
///
/// Unlike a per-request string comparison, an unknown value is rejected when
/// the configuration is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    /// Whether error responses may carry diagnostic stack traces.
    pub fn exposes_stack_traces(self) -> bool {
        !matches!(self, Environment::Production)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!(
                "unknown environment '{other}' (expected production, development or test)"
            )),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 4001)
    pub port: u16,

    /// Deployment environment (from `NODE_ENV`)
    pub environment: Environment,

    /// Maximum request body size in bytes (default: 1 MiB)
    pub max_request_body_size: usize,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    /// Origins allowed by exact match, in addition to ngrok tunnels.
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests allowed per window per client IP (default: 1000).
    /// Set to 0 to disable rate limiting.
    pub rate_limit_max: u32,

    /// Fixed window length (default: 15 minutes)
    pub rate_limit_window: Duration,

    /// Number of reverse proxy hops trusted when reading `X-Forwarded-For`
    /// (default: 1). Zero means forwarded headers are ignored.
    pub trust_proxy_hops: usize,

    // =========================================================================
    // Timeout Configuration
    // =========================================================================
    /// Request processing threshold (default: 30 seconds)
    pub request_timeout: Duration,

    /// Grace added to the threshold before the fallback 503 (default: 500ms)
    pub request_timeout_grace: Duration,

    // =========================================================================
    // Scheduled Job Configuration
    // =========================================================================
    /// Schedule for the daily delivery generation task (default: "0 0 * * *")
    pub delivery_job_cron: String,

    /// Registry name of the delivery generation task
    pub delivery_job_task: String,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log filter directives from `RUST_LOG` (e.g., "info", "padaria_backend=debug")
    pub log_level: String,

    /// Log output format (default: pretty)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value is invalid
    /// (e.g., non-numeric PORT, unknown NODE_ENV, unparsable schedule).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or(defaults.host),
            port: Self::parse_env("PORT", defaults.port)?,
            environment: Self::parse_env("NODE_ENV", defaults.environment)?,
            max_request_body_size: Self::parse_env(
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            )?,

            // CORS
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS")
                .unwrap_or(defaults.cors_allowed_origins),

            // Rate limiting
            rate_limit_max: Self::parse_env("RATE_LIMIT_MAX", defaults.rate_limit_max)?,
            rate_limit_window: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window.as_secs(),
            )?),
            trust_proxy_hops: Self::parse_env("TRUST_PROXY_HOPS", defaults.trust_proxy_hops)?,

            // Timeouts
            request_timeout: Duration::from_millis(Self::parse_env(
                "REQUEST_TIMEOUT_MS",
                30_000,
            )?),
            request_timeout_grace: Duration::from_millis(Self::parse_env(
                "REQUEST_TIMEOUT_GRACE_MS",
                500,
            )?),

            // Scheduled job
            delivery_job_cron: env::var("DELIVERY_JOB_CRON")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.delivery_job_cron),
            delivery_job_task: env::var("DELIVERY_JOB_TASK")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.delivery_job_task),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: Self::parse_env("LOG_FORMAT", defaults.log_format)?,
            metrics_port: Self::parse_env("METRICS_PORT", defaults.metrics_port)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.rate_limit_window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "REQUEST_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        DailySchedule::parse(&self.delivery_job_cron)
            .map_err(|e| AppError::ConfigError(format!("Invalid DELIVERY_JOB_CRON: {e}")))?;

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_max > 0
    }

    /// Time after which an unanswered request receives the fallback 503.
    pub fn timeout_deadline(&self) -> Duration {
        self.request_timeout + self.request_timeout_grace
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        self.metrics_enabled()
            .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated list; `None` when the variable is unset or empty.
    fn parse_list(name: &str) -> Option<Vec<String>> {
        let values: Vec<String> = env::var(name)
            .ok()?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        (!values.is_empty()).then_some(values)
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 4001,
            environment: Environment::Development,
            max_request_body_size: 1024 * 1024, // 1 MiB
            // CORS
            cors_allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
            // Rate limiting
            rate_limit_max: 1000,
            rate_limit_window: Duration::from_secs(15 * 60),
            trust_proxy_hops: 1,
            // Timeouts
            request_timeout: Duration::from_secs(30),
            request_timeout_grace: Duration::from_millis(500),
            // Scheduled job
            delivery_job_cron: "0 0 * * *".to_string(),
            delivery_job_task: "gerarEntregasDoDia".to_string(),
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 0,
        }
    }
}
