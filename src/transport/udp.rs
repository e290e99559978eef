//! Upstream UDP dialing
//!
//! A UDP session talks to its upstream through a socket connected to the
//! target, so the kernel discards datagrams from every other source.

use super::UpstreamAddr;
use crate::error::Result;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Bind an ephemeral socket and connect it to the upstream target
pub async fn connect(addr: &UpstreamAddr) -> Result<UdpSocket> {
    let resolved = addr.resolve().await?;

    let local: SocketAddr = if resolved.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(resolved).await?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_peer() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();

        let socket = connect(&UpstreamAddr::new("127.0.0.1", port)).await.unwrap();
        assert_eq!(socket.peer_addr().unwrap(), upstream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_connected_socket_ignores_other_sources() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();

        let socket = connect(&UpstreamAddr::new("127.0.0.1", port)).await.unwrap();
        let local = socket.local_addr().unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, local.port()));

        stranger.send_to(b"noise", target).await.unwrap();
        upstream.send_to(b"reply", target).await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"reply");
    }
}
