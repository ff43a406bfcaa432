//! Frame sink service entry point.
//!
//! ```text
//! FrameReader -> FrameSink -> memcached (BMP payload) + Redis stream (record)
//! ```
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{RUN_MODE}.toml)
//! 2. Environment variables (prefixed with FRAMESINK__)

use anyhow::{Context, Result};
use frame_sink::config::ServiceConfig;
use frame_sink::{Config, FrameReader, FrameSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long to wait for the pump to notice a shutdown request
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        width = config.frame.width,
        height = config.frame.height,
        "Starting frame sink service"
    );

    config.validate().context("Invalid configuration")?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let pump_running = running.clone();
    let pump_config = config.clone();

    // Backends and input are blocking; keep them off the runtime threads
    let mut pump = tokio::task::spawn_blocking(move || run_pump(&pump_config, &pump_running));

    tokio::select! {
        result = &mut pump => return finish(result),
        _ = shutdown_signal() => {}
    }

    info!("Shutting down frame sink");
    running.store(false, Ordering::SeqCst);

    match tokio::time::timeout(SHUTDOWN_GRACE, pump).await {
        Ok(result) => finish(result)?,
        Err(_) => warn!("Frame pump still waiting on input, exiting without it"),
    }

    info!("Frame sink stopped");

    Ok(())
}

/// Publish frames until the input ends or shutdown is requested
fn run_pump(config: &Config, running: &AtomicBool) -> Result<u64> {
    let mut sink = FrameSink::connect(config).context("Failed to start frame sink")?;
    let mut reader = FrameReader::open(config).context("Failed to open frame input")?;
    let mut incomplete = 0u64;

    while running.load(Ordering::SeqCst) {
        let Some(frame) = reader.next_frame().context("Failed to read frame")? else {
            info!("Frame input ended");
            break;
        };

        match sink.publish(&frame) {
            Ok(report) if report.is_success() => {}
            Ok(_) => incomplete += 1,
            Err(e) => {
                incomplete += 1;
                warn!(error = %e, "Dropping frame");
            }
        }
    }

    sink.close();

    info!(
        frames = reader.frames_read(),
        incomplete = incomplete,
        "Frame pump stopped"
    );

    Ok(reader.frames_read())
}

fn finish(result: std::result::Result<Result<u64>, JoinError>) -> Result<()> {
    let frames = result.context("Frame pump panicked")??;
    info!(frames = frames, "Frame pump finished");
    Ok(())
}

/// Initialize logging.
fn init_tracing(config: &ServiceConfig) -> Result<()> {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("frame_sink={}", level).parse()?)
        .add_directive("redis=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
