//! Transport module for Portferry
//!
//! Socket plumbing shared by the listeners and sessions: upstream address
//! resolution, local binds with the port-in-use probe, and upstream dialing.

mod addr;
mod bind;
pub mod tcp;
pub mod udp;

pub use addr::UpstreamAddr;
pub use bind::{bind_tcp_listener, bind_udp_socket, probe_port};

use crate::config::TcpConfig;
use std::time::Duration;
use tokio::net::TcpStream;

/// Socket options for upstream TCP connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts { nodelay: true }
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)
    }
}

/// Make the next close of `stream` abortive (RST instead of FIN)
pub fn set_abortive_close(stream: &TcpStream) -> std::io::Result<()> {
    socket2::SockRef::from(stream).set_linger(Some(Duration::ZERO))
}
