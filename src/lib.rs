//! # Portferry - Local TCP/UDP Port Forwarder
//!
//! Portferry listens on one local port for both TCP and UDP and relays all
//! traffic to a single upstream target. It can be used to route traffic
//! through a specific endpoint without changing the client application.
//!
//! ## Features
//!
//! - **TCP Relay**: One session per connection, with half-close propagation
//! - **UDP Relay**: NAT-style sessions per client endpoint, each with its own
//!   upstream socket, evicted after a period of inactivity
//! - **All-or-nothing Start**: If either protocol cannot bind, nothing stays bound
//! - **Configurable Stop**: Drain established sessions or abort them
//!
//! ## Usage
//!
//! ```rust,ignore
//! use portferry::config::load_config;
//! use portferry::{run_controller, ErrorReporter};
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_controller(config, ErrorReporter::log(), shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! TCP client ──► TcpForwarder ──► TcpPipe ──► Target
//! UDP client ──► UdpForwarder ──► SessionTable ──► UdpSession ──► Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod controller;
pub mod error;
pub mod forward;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config, StopPolicy, TargetDescriptor};
pub use controller::{run_controller, Controller};
pub use error::{ForwarderError, Protocol};
pub use forward::{ErrorReport, ErrorReporter, Forwarder};

/// Version of the Portferry library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
