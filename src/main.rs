use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use padaria_backend::config::LogFormat;
use padaria_backend::{ApiModules, AppState, Config, TaskRegistry, build_router, metrics, utils};

/// Filter used when `RUST_LOG` is unset or blank.
const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() -> ExitCode {
    // .env before anything reads the environment
    let _ = dotenvy::dotenv();

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Build the log filter from `RUST_LOG` directives.
fn log_filter(directives: &str) -> EnvFilter {
    if directives.trim().is_empty() {
        return EnvFilter::new(DEFAULT_LOG_FILTER);
    }
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Initialize logging from the loaded configuration.
fn init_tracing(directives: &str, format: LogFormat) {
    let filter = log_filter(directives);

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration; logging depends on it
    let config = match Config::from_env() {
        Ok(config) => {
            init_tracing(&config.log_level, config.log_format);
            config
        }
        Err(e) => {
            init_tracing(DEFAULT_LOG_FILTER, LogFormat::default());
            error!("Configuration error: {e}");
            return Err(exitcode::CONFIG);
        }
    };

    info!(
        "Starting Padaria Backend v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        host = %config.host,
        port = %config.port,
        environment = %config.environment,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    // Business modules and the delivery task are provided by embedders of
    // the library; this binary serves the pipeline on its own.
    let registry = TaskRegistry::new();
    let modules = ApiModules::new();

    let state = AppState::new(config.clone(), &registry).map_err(|e| {
        error!("Failed to initialize application state: {e}");
        exitcode::CONFIG
    })?;

    let mounted: Vec<_> = modules.mounted_prefixes().collect();
    let unmounted: Vec<_> = modules.unmounted_prefixes().collect();
    info!(?mounted, "API modules mounted");
    if !unmounted.is_empty() {
        warn!(?unmounted, "API prefixes without a module answer 404");
    }

    let app = build_router(state.clone(), modules).map_err(|e| {
        error!("Failed to build router: {e}");
        exitcode::CONFIG
    })?;

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");

    // Peer addresses feed client IP derivation for rate limiting
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Gracefully shutdown background tasks
    info!(
        uptime_secs = state.uptime_seconds(),
        "HTTP server stopped, shutting down background tasks..."
    );
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
