//! Listener configuration types
//!
//! Defines socket and session parameters for the TCP and UDP listeners.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default receive buffer size in bytes
fn default_buffer_size() -> usize {
    16384
}

/// Default listen backlog
fn default_backlog() -> u32 {
    1024
}

fn default_nodelay() -> bool {
    true
}

/// Default UDP idle timeout in seconds
fn default_idle_timeout() -> u64 {
    60
}

/// Default UDP sweep interval in seconds
fn default_sweep_interval() -> u64 {
    10
}

/// Default per-session outbound queue length
fn default_queue_size() -> usize {
    1024
}

/// TCP listener configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY on the upstream connection
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Per-direction relay buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl TcpConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("TCP buffer size must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Upper bound for the UDP idle timeout and sweep interval (one day)
pub const MAX_UDP_TIMER_SECS: u64 = 24 * 60 * 60;

/// UDP listener configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UdpConfig {
    /// Seconds of inactivity after which a session is evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Receive buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum datagrams queued per session while upstream is busy
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            buffer_size: default_buffer_size(),
            queue_size: default_queue_size(),
        }
    }
}

impl UdpConfig {
    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Sweep interval as a duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.idle_timeout == 0 {
            return Err("UDP idle timeout must be greater than zero".to_string());
        }
        if self.sweep_interval == 0 {
            return Err("UDP sweep interval must be greater than zero".to_string());
        }
        if self.idle_timeout > MAX_UDP_TIMER_SECS {
            return Err(format!(
                "UDP idle timeout must be at most {} seconds",
                MAX_UDP_TIMER_SECS
            ));
        }
        if self.sweep_interval > MAX_UDP_TIMER_SECS {
            return Err(format!(
                "UDP sweep interval must be at most {} seconds",
                MAX_UDP_TIMER_SECS
            ));
        }
        if self.buffer_size == 0 {
            return Err("UDP buffer size must be greater than zero".to_string());
        }
        if self.queue_size == 0 {
            return Err("UDP queue size must be greater than zero".to_string());
        }
        Ok(())
    }
}
