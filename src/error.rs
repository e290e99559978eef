//! Error types for Portferry
//!
//! This module defines the error taxonomy of the forwarding engine. Only
//! [`ForwarderError::PortInUse`] and [`ForwarderError::TargetResolution`] are
//! ever surfaced to the caller of `start()`; everything else stays local to
//! the session that produced it.

use std::fmt;
use std::io;
use thiserror::Error;

/// Transport protocol of a listener, used in error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TCP listener
    Tcp,
    /// UDP listener
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// Main error type for Portferry operations
#[derive(Error, Debug)]
pub enum ForwarderError {
    /// The local port is already bound by another listener
    #[error("Port already in use: {protocol} port {port}")]
    PortInUse {
        /// Protocol of the listener that failed to bind
        protocol: Protocol,
        /// Local port that is occupied
        port: u16,
    },

    /// The target address is neither a literal IP nor resolvable to IPv4
    #[error("Wrong target server: {0}")]
    TargetResolution(String),

    /// Socket error on an established relay
    #[error("Transient IO error: {0}")]
    TransientIo(io::Error),

    /// Listener socket was closed by `stop()`
    #[error("Listener closed")]
    ListenerClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ForwarderError {
    /// Translate a bind failure into a typed error.
    ///
    /// `AddrInUse` is reported as [`PortInUse`]. On Windows an exclusive
    /// bind on an occupied port fails with access denied, so there
    /// `PermissionDenied` maps to [`PortInUse`] too; elsewhere it means a
    /// privileged port and stays an IO error.
    ///
    /// [`PortInUse`]: ForwarderError::PortInUse
    pub fn from_bind(err: io::Error, protocol: Protocol, port: u16) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => ForwarderError::PortInUse { protocol, port },
            #[cfg(windows)]
            io::ErrorKind::PermissionDenied => ForwarderError::PortInUse { protocol, port },
            _ => ForwarderError::Io(err),
        }
    }

    /// Whether this error is the expected result of a listener shutdown
    pub fn is_listener_closed(&self) -> bool {
        matches!(self, ForwarderError::ListenerClosed)
    }
}

/// Result alias used by the forwarding engine
pub type Result<T> = std::result::Result<T, ForwarderError>;

/// Whether a socket error only means that the peer went away.
///
/// These are routine on a relay (a browser tab closed mid-download, an RST
/// from upstream) and are logged at debug level rather than as warnings.
pub fn is_quiet_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
    )
}

/// Log a session-local IO error at the level it deserves
pub fn log_io_error(context: &str, err: &io::Error) {
    if is_quiet_disconnect(err) {
        tracing::debug!("{}: {}", context, err);
    } else {
        tracing::warn!("{}: {}", context, err);
    }
}
