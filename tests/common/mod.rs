//! Test utilities for Portferry
//!
//! Echo servers, free-port helpers and a configuration builder shared by the
//! integration tests.

#![allow(dead_code)]

use portferry::config::{Config, StopPolicy, TargetDescriptor};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// How long a test waits for one network event
pub const WAIT: Duration = Duration::from_secs(3);

/// Find a port that is currently free for both TCP and UDP
pub fn free_port() -> u16 {
    loop {
        let tcp = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = tcp.local_addr().unwrap().port();
        if std::net::UdpSocket::bind(("0.0.0.0", port)).is_ok() {
            return port;
        }
    }
}

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Spawn a TCP echo server that half-closes after the client does
pub async fn tcp_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    addr
}

/// Events seen by an observed TCP upstream
#[derive(Debug, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Bytes received from the forwarder
    Data(Vec<u8>),
    /// The forwarder half-closed its side
    Eof,
}

/// Spawn a TCP upstream that echoes and reports what it sees
pub async fn observed_tcp_server() -> (SocketAddr, mpsc::UnboundedReceiver<UpstreamEvent>) {
    let (listener, addr) = create_test_listener().await;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => {
                            let _ = tx.send(UpstreamEvent::Eof);
                            let _ = stream.shutdown().await;
                            break;
                        }
                        Ok(n) => {
                            let _ = tx.send(UpstreamEvent::Data(buf[..n].to_vec()));
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, rx)
}

/// Spawn a UDP upstream that echoes and reports each datagram with its source
pub async fn observed_udp_server() -> (SocketAddr, mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 65536];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = tx.send((buf[..n].to_vec(), from));
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    (addr, rx)
}

/// Connect a TCP client to the forwarder on `port`
pub async fn connect_tcp(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

/// Bind a UDP client connected to the forwarder on `port`
pub async fn connect_udp(port: u16) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(("127.0.0.1", port)).await.unwrap();
    socket
}

/// Receive one datagram or fail the test
pub async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 65536];
    let n = tokio::time::timeout(WAIT, socket.recv(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    buf[..n].to_vec()
}

/// Test configuration builder
pub struct TestConfigBuilder {
    upstream: SocketAddr,
    local_port: u16,
    idle_timeout: u64,
    sweep_interval: u64,
    stop_policy: StopPolicy,
}

impl TestConfigBuilder {
    /// Create a builder forwarding a free local port to `upstream`
    pub fn new(upstream: SocketAddr) -> Self {
        TestConfigBuilder {
            upstream,
            local_port: free_port(),
            idle_timeout: 60,
            sweep_interval: 10,
            stop_policy: StopPolicy::Drain,
        }
    }

    /// Set the local port
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Set UDP idle timeout and sweep interval in seconds
    pub fn udp_timing(mut self, idle_timeout: u64, sweep_interval: u64) -> Self {
        self.idle_timeout = idle_timeout;
        self.sweep_interval = sweep_interval;
        self
    }

    /// Set the stop policy
    pub fn stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    /// Build the target descriptor
    pub fn target(&self) -> TargetDescriptor {
        TargetDescriptor::new(
            self.upstream.ip().to_string(),
            self.upstream.port(),
            self.local_port,
        )
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        let mut config = Config::single(self.target());
        config.forwarder.stop_policy = self.stop_policy;
        config.udp.idle_timeout = self.idle_timeout;
        config.udp.sweep_interval = self.sweep_interval;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_test_listener() {
        let (listener, addr) = create_test_listener().await;
        assert!(addr.port() > 0);
        drop(listener);
    }

    #[test]
    fn test_config_builder() {
        let upstream: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = TestConfigBuilder::new(upstream)
            .local_port(18443)
            .udp_timing(1, 1)
            .stop_policy(StopPolicy::Abort)
            .build();

        let target = config.current_server().unwrap();
        assert_eq!(target.address, "127.0.0.1");
        assert_eq!(target.server_port, 9000);
        assert_eq!(target.local_port, 18443);
        assert_eq!(config.udp.idle_timeout, 1);
        assert_eq!(config.forwarder.stop_policy, StopPolicy::Abort);
    }
}
