//! Forwarder lifecycle control
//!
//! The [`Controller`] owns the loaded configuration and the forwarder built
//! from it. A configuration change never mutates a running forwarder: the
//! old one is stopped completely before the new one starts.

use crate::config::Config;
use crate::error::{ForwarderError, Result};
use crate::forward::{ErrorReporter, Forwarder};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Owns the active configuration and forwarder
#[derive(Debug)]
pub struct Controller {
    config: Config,
    forwarder: Option<Forwarder>,
    reporter: ErrorReporter,
}

impl Controller {
    /// Create a stopped controller
    pub fn new(config: Config, reporter: ErrorReporter) -> Self {
        Controller {
            config,
            forwarder: None,
            reporter,
        }
    }

    /// Current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether a forwarder is running
    pub fn is_running(&self) -> bool {
        self.forwarder.is_some()
    }

    /// Running forwarder, if any
    pub fn forwarder(&self) -> Option<&Forwarder> {
        self.forwarder.as_ref()
    }

    /// Start forwarding the selected target.
    ///
    /// Does nothing when forwarding is disabled or already running. Failures
    /// are returned and also pushed through the error hook.
    pub async fn start(&mut self) -> Result<()> {
        if self.forwarder.is_some() {
            return Ok(());
        }
        if !self.config.forwarder.enabled {
            info!("Forwarding disabled");
            return Ok(());
        }

        match self.try_start().await {
            Ok(forwarder) => {
                info!("Forwarding {}", forwarder.target());
                self.forwarder = Some(forwarder);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to start forwarder: {}", e);
                self.reporter.report("start", &e);
                Err(e)
            }
        }
    }

    async fn try_start(&self) -> Result<Forwarder> {
        self.config.validate().map_err(ForwarderError::Config)?;
        let target = self
            .config
            .current_server()
            .cloned()
            .ok_or_else(|| ForwarderError::Config("No server selected".to_string()))?;
        Forwarder::start(target, &self.config, self.reporter.clone()).await
    }

    /// Stop the running forwarder; returns once its port is free
    pub async fn stop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.stop().await;
        }
    }

    /// Replace the configuration, restarting the forwarder
    pub async fn reload(&mut self, config: Config) -> Result<()> {
        info!("Reloading configuration");
        self.stop().await;
        self.config = config;
        self.start().await
    }
}

/// Run a controller for `config` until a shutdown signal arrives
pub async fn run_controller(
    config: Config,
    reporter: ErrorReporter,
    mut shutdown_rx: broadcast::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut controller = Controller::new(config, reporter);
    controller.start().await?;

    let _ = shutdown_rx.recv().await;
    info!("Shutting down");
    controller.stop().await;

    Ok(())
}
