//! Local listener binds
//!
//! Both listeners bind `0.0.0.0:<port>` with SO_REUSEADDR. Since address
//! reuse can let a second process share a port that is already serving, a
//! probe runs first and refuses ports that have a live listener on them.

use crate::error::{ForwarderError, Protocol, Result};
use socket2::{Domain, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// How long the TCP probe waits for a connection to an existing listener
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

/// Check whether `port` already has a listener for `protocol`.
///
/// TCP: a listener exists if a loopback connect to the port succeeds.
/// UDP: a listener exists if an exclusive (no address reuse) bind fails.
pub async fn probe_port(protocol: Protocol, port: u16) -> bool {
    match protocol {
        Protocol::Tcp => {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            matches!(
                tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
                Ok(Ok(_))
            )
        }
        Protocol::Udp => match std::net::UdpSocket::bind(any_addr(port)) {
            Ok(_) => false,
            Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
        },
    }
}

/// Bind the TCP listener on all interfaces
pub async fn bind_tcp_listener(port: u16, backlog: u32) -> Result<TcpListener> {
    if probe_port(Protocol::Tcp, port).await {
        return Err(ForwarderError::PortInUse {
            protocol: Protocol::Tcp,
            port,
        });
    }

    let bind = || -> std::io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&any_addr(port).into())?;
        socket.listen(backlog.min(i32::MAX as u32) as i32)?;
        TcpListener::from_std(socket.into())
    };

    bind().map_err(|e| ForwarderError::from_bind(e, Protocol::Tcp, port))
}

/// Bind the shared UDP socket on all interfaces
pub async fn bind_udp_socket(port: u16) -> Result<UdpSocket> {
    if probe_port(Protocol::Udp, port).await {
        return Err(ForwarderError::PortInUse {
            protocol: Protocol::Udp,
            port,
        });
    }

    let bind = || -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&any_addr(port).into())?;
        UdpSocket::from_std(socket.into())
    };

    bind().map_err(|e| ForwarderError::from_bind(e, Protocol::Udp, port))
}
