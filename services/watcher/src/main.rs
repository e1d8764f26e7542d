//! Tankwatch service.
//!
//! Runs one watcher per configured tank:
//!
//! ```text
//! Camera -> FrameSource -> Detectors -> Arbiter -> ClipRecorder -> Notifier
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. A file named by `TANKWATCH_CONFIG`, or config/default.toml plus
//!    config/{RUN_MODE}.toml
//! 2. Environment variables (prefixed with TANKWATCH_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use std::time::Duration;
use tankwatch::config::{self, WatcherConfig};
use tankwatch::supervisor::{log_status, Supervisor};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "tankwatch",
        version = env!("CARGO_PKG_VERSION"),
        tanks = config.tanks.len(),
        "Starting tank watcher"
    );

    // Fail fast before any tank starts
    config.validate()?;

    if config.health.enable_metrics {
        init_metrics(config.health.port)?;
    }

    let mut supervisor = Supervisor::from_config(config.clone())?;
    let health_handle =
        supervisor.spawn_health_monitor(Duration::from_secs(config.health.interval_secs));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Initiating graceful shutdown...");
        }
        _ = supervisor.wait() => {
            warn!("All tanks stopped on their own");
        }
    }

    supervisor.shutdown().await;
    health_handle.abort();

    // Log final statistics
    info!("=== Final Statistics ===");
    for status in supervisor.statuses() {
        log_status(&status);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration from an explicit file, the config directory, or the
/// environment.
fn load_config() -> anyhow::Result<WatcherConfig> {
    if let Ok(path) = std::env::var("TANKWATCH_CONFIG") {
        return WatcherConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path));
    }

    // Try loading from files first, fall back to environment
    let config = WatcherConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        WatcherConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("tankwatch={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize the Prometheus metrics exporter.
fn init_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
