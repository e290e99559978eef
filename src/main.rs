//! Portferry - Local TCP/UDP Port Forwarder
//!
//! This is the main entry point for the Portferry application.

use anyhow::{bail, Context, Result};
use clap::Parser;
use portferry::config::load_config;
use portferry::{Config, Controller, ErrorReporter, TargetDescriptor};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Portferry - forward one local port (TCP and UDP) to an upstream target
#[derive(Parser, Debug)]
#[command(name = "portferry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream server address, used instead of a configuration file
    #[arg(long, conflicts_with = "config")]
    server: Option<String>,

    /// Upstream server port
    #[arg(long, default_value_t = 443, requires = "server")]
    server_port: u16,

    /// Local port to listen on
    #[arg(long, default_value_t = 443, requires = "server")]
    bind_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,

    /// Append logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Control events raised by process signals
enum Signal {
    Shutdown,
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log, args.log_file.as_deref())?;

    info!("Portferry v{}", portferry::VERSION);
    let config = initial_config(&args)?;

    let mut controller = Controller::new(config, ErrorReporter::log());
    controller.start().await?;
    if !controller.is_running() {
        info!("Nothing to forward, exiting");
        return Ok(());
    }

    // Handle Ctrl+C, termination and reload signals
    let (signal_tx, mut signal_rx) = mpsc::channel(4);
    tokio::spawn(watch_signals(signal_tx));

    while let Some(signal) = signal_rx.recv().await {
        match signal {
            Signal::Shutdown => break,
            Signal::Reload => {
                let Some(path) = &args.config else {
                    info!("No configuration file to reload");
                    continue;
                };
                match load_config(path) {
                    Ok(config) => {
                        // Failures are already logged by the error hook
                        let _ = controller.reload(config).await;
                    }
                    Err(e) => error!("Failed to reload {:?}: {:#}", path, e),
                }
            }
        }
    }

    controller.stop().await;
    info!("Shutdown complete");
    Ok(())
}

/// Build the startup configuration from the file or the command line
fn initial_config(args: &Args) -> Result<Config> {
    if let Some(path) = &args.config {
        let config = load_config(path)?;
        info!("Configuration loaded from: {:?}", path);
        return Ok(config);
    }
    if let Some(server) = &args.server {
        return Ok(Config::single(TargetDescriptor::new(
            server.as_str(),
            args.server_port,
            args.bind_port,
        )));
    }
    bail!("Either --config or --server must be given")
}

async fn watch_signals(tx: mpsc::Sender<Signal>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sighup) =
            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(term), Ok(hup)) => (term, hup),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to setup signal handlers: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = tx.send(Signal::Shutdown).await;
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading...");
                    if tx.send(Signal::Reload).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        // On Windows, only handle Ctrl+C
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = tx.send(Signal::Shutdown).await;
}

/// Open `path` for appending, creating it and its directory if needed
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {:?}", dir))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {:?}", path))
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool, log_file: Option<&Path>) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if let Some(path) = log_file {
        let writer = std::sync::Mutex::new(open_log_file(path)?);
        let builder = FmtSubscriber::builder()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(writer);
        if json {
            tracing::subscriber::set_global_default(builder.json().finish())?;
        } else {
            tracing::subscriber::set_global_default(builder.with_target(true).finish())?;
        }
    } else if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
