//! trackbridge - Main entry point
//!
//! Loads `.env` and the bootstrap config, starts the listener supervisor and
//! the health endpoint, then waits for SIGINT/SIGTERM.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use trackbridge_common::config::{load_config, write_toml_config, LoggingConfig, TomlConfig};
use trackbridge_common::connect::FtrackConnector;
use trackbridge_common::RetryPolicy;
use trackbridge_supervisor::{build_supervisor, health};

/// Command-line arguments for trackbridge
#[derive(Parser, Debug)]
#[command(name = "trackbridge")]
#[command(about = "Event listeners for production tracking servers")]
#[command(version)]
struct Args {
    /// Bootstrap config file (falls back to TB_CONFIG, then the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Health endpoint bind address
    #[arg(long, env = "TB_HEALTH_ADDR")]
    health_addr: Option<SocketAddr>,

    /// Run only this listener (repeatable)
    #[arg(long = "only", value_name = "LISTENER")]
    only: Vec<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "TB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Write the default config to this path and exit
    #[arg(long, value_name = "PATH")]
    init_config: Option<PathBuf>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    if let Some(path) = &args.init_config {
        write_toml_config(&TomlConfig::default(), path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote default config to {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = load_config(args.config.as_deref());
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_tracing(&config.logging)?;

    info!(
        "Starting trackbridge v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let health_addr = match args.health_addr {
        Some(addr) => addr,
        None => config
            .supervisor
            .health_addr
            .parse()
            .with_context(|| format!("Invalid health address {}", config.supervisor.health_addr))?,
    };

    let connector = Arc::new(FtrackConnector::new(RetryPolicy::from(&config.retry)));
    let supervisor = build_supervisor(&config, &args.only, connector)?;
    info!(listeners = ?supervisor.names(), "Listeners selected");

    let shutdown = CancellationToken::new();
    let health = tokio::spawn(health::serve(health_addr, supervisor.board(), shutdown.clone()));
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match shutdown_signal().await {
                Ok(name) => {
                    info!(signal = name, "Stopping listeners");
                    shutdown.cancel();
                }
                // Listeners keep running; only a hard kill stops the process now
                Err(e) => error!(error = %e, "Could not listen for stop signals"),
            }
        }
    });

    let report = supervisor.run(shutdown.clone()).await?;
    shutdown.cancel();
    match health.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Health endpoint failed"),
        Err(e) => warn!(error = %e, "Health endpoint task aborted"),
    }

    if !report.abandoned.is_empty() {
        error!(abandoned = ?report.abandoned, "Some listeners were still running at exit");
    }
    let code = report.exit_code();
    info!(exit_code = code, "Shutdown complete");
    Ok(ExitCode::from(code))
}

/// Name of the first stop signal received
async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            interrupted = signal::ctrl_c() => interrupted.map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|()| "Ctrl+C")
    }
}
