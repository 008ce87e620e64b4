//! Tether Daemon
//!
//! Keeps interactive shells alive while clients come and go.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_daemon::config::{Config, DaemonConfig, EnvOverride};
use tether_daemon::{transport, Broker};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Tether - persistent shell sessions over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the session broker until interrupted
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Shell to run in new sessions (overrides session.shell)
        #[arg(long, value_name = "PATH")]
        shell: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Write the configuration to FILE instead of printing it
        #[arg(long, value_name = "FILE")]
        write: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let overrides = config.apply_env_overrides();

    match cli.command {
        Commands::Serve { bind, shell } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(shell) = shell {
                config.session.shell = shell;
            }
            config.validate()?;

            let _log_guard = init_tracing(cli.verbose, &config.daemon)?;
            if let Some(path) = &cli.config {
                tracing::info!("Using config file: {:?}", path);
            }
            for outcome in &overrides {
                outcome.log();
            }

            run_server(config).await
        }
        Commands::Config { write } => {
            for outcome in &overrides {
                if let EnvOverride::Ignored { var, value, reason } = outcome {
                    eprintln!("warning: ignoring {var}: {reason}: {value:?}");
                }
            }
            match write {
                Some(path) => {
                    config.save(&path)?;
                    eprintln!("Wrote configuration to {}", path.display());
                }
                None => print!("{}", config.to_toml()?),
            }
            Ok(())
        }
    }
}

/// Installs the global subscriber.
///
/// `--verbose` wins over `RUST_LOG`, which wins over `daemon.log_level`. The
/// returned guard must stay alive for file logging to flush.
fn init_tracing(verbose: bool, daemon: &DaemonConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(daemon.log_level.to_lowercase()))
            .context("Invalid log filter")?
    };

    let Some(log_file) = &daemon.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let dir = log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = log_file
        .file_name()
        .with_context(|| format!("log_file has no file name: {}", log_file.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(Some(guard))
}

/// Runs the broker and its WebSocket listener until SIGINT or SIGTERM.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let addr = config.bind_addr()?;
    let listener = transport::bind(addr).await?;
    let broker = Broker::from_config(&config);

    tracing::info!(
        addr = %addr,
        shell = %config.session.shell,
        max_sessions = config.session.max_sessions,
        scrollback = config.session.scrollback_buffer_size,
        "Tether listening"
    );

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(transport::serve(listener, broker.clone(), shutdown.clone()));

    let signal = wait_for_shutdown_signal().await;

    shutdown.cancel();
    if let Err(e) = server.await {
        tracing::warn!(error = %e, "Listener task ended abnormally");
    }
    broker.shutdown().await;

    signal
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }

    Ok(())
}
