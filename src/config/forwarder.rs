//! Forwarder configuration types
//!
//! Defines the root configuration, the list of forwarding targets and the
//! stop policy.

use super::{TcpConfig, UdpConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default target address
fn default_server() -> String {
    "104.224.129.11".to_string()
}

/// Default upstream and bind port
fn default_port() -> u16 {
    443
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Forwarding targets and selection
    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// TCP listener configuration
    #[serde(default)]
    pub tcp: TcpConfig,

    /// UDP listener configuration
    #[serde(default)]
    pub udp: UdpConfig,
}

impl Config {
    /// Build a configuration that forwards a single target
    pub fn single(target: TargetDescriptor) -> Self {
        Config {
            forwarder: ForwarderConfig {
                enabled: true,
                index: 0,
                servers: vec![target],
                stop_policy: StopPolicy::default(),
            },
            ..Default::default()
        }
    }

    /// The selected target, if the index points at one
    pub fn current_server(&self) -> Option<&TargetDescriptor> {
        self.forwarder.servers.get(self.forwarder.index)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        for server in &self.forwarder.servers {
            server.validate()?;
        }
        if self.forwarder.enabled && self.current_server().is_none() {
            return Err(format!(
                "Server index {} out of range ({} configured)",
                self.forwarder.index,
                self.forwarder.servers.len()
            ));
        }
        self.tcp.validate()?;
        self.udp.validate()?;
        Ok(())
    }
}

/// Forwarding targets and the currently selected one
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ForwarderConfig {
    /// Whether forwarding is switched on
    #[serde(default)]
    pub enabled: bool,

    /// Index of the active entry in `servers`
    #[serde(default)]
    pub index: usize,

    /// Known forwarding targets
    #[serde(default = "default_servers")]
    pub servers: Vec<TargetDescriptor>,

    /// What `stop()` does with in-flight sessions
    #[serde(default)]
    pub stop_policy: StopPolicy,
}

fn default_servers() -> Vec<TargetDescriptor> {
    vec![TargetDescriptor::default()]
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            enabled: false,
            index: 0,
            servers: default_servers(),
            stop_policy: StopPolicy::default(),
        }
    }
}

/// Behaviour of `stop()` towards sessions that are already established
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopPolicy {
    /// Close the listeners only; sessions end when their peers finish
    #[default]
    #[serde(rename = "drain")]
    Drain,
    /// Close the listeners and abort every in-flight session
    #[serde(rename = "abort")]
    Abort,
}

/// Upstream endpoint plus the local port relayed to it
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    /// Upstream host name or literal IP address
    #[serde(rename = "server", default = "default_server")]
    pub address: String,

    /// Upstream port
    #[serde(default = "default_port")]
    pub server_port: u16,

    /// Local port to bind on all interfaces
    #[serde(rename = "bind_port", default = "default_port")]
    pub local_port: u16,
}

impl Default for TargetDescriptor {
    fn default() -> Self {
        TargetDescriptor {
            address: default_server(),
            server_port: default_port(),
            local_port: default_port(),
        }
    }
}

impl TargetDescriptor {
    /// Create a new target descriptor
    pub fn new(address: impl Into<String>, server_port: u16, local_port: u16) -> Self {
        TargetDescriptor {
            address: address.into(),
            server_port,
            local_port,
        }
    }

    /// Validate ports and address
    pub fn validate(&self) -> Result<(), String> {
        check_port(self.server_port)?;
        check_port(self.local_port)?;
        if self.address.trim().is_empty() {
            return Err("Server IP can not be blank".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.is_empty() {
            return f.write_str("New server");
        }
        write!(
            f,
            "{}:{} (bind {})",
            self.address, self.server_port, self.local_port
        )
    }
}

fn check_port(port: u16) -> Result<(), String> {
    if port == 0 {
        return Err("Port out of range".to_string());
    }
    Ok(())
}
