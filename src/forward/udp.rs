//! UDP listener
//!
//! One shared socket receives datagrams from every client. Each datagram is
//! copied out of the receive buffer and routed to the sender's session.

use super::session::{SessionSettings, SessionTable};
use crate::config::{StopPolicy, UdpConfig};
use crate::error::{log_io_error, Result};
use crate::forward::ErrorReporter;
use crate::transport::{bind_udp_socket, UpstreamAddr};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Running UDP listener
#[derive(Debug)]
pub struct UdpForwarder {
    /// Bound address
    local_addr: SocketAddr,
    /// Client sessions
    table: Arc<SessionTable>,
    /// Stops the receive loop
    recv_cancel: CancellationToken,
    /// Receive loop task; holds the only strong reference to the socket
    recv_task: Mutex<Option<JoinHandle<()>>>,
    /// Eviction sweep task
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpForwarder {
    /// Bind `local_port` and start receiving
    pub async fn start(
        local_port: u16,
        upstream: UpstreamAddr,
        config: &UdpConfig,
        reporter: ErrorReporter,
    ) -> Result<Self> {
        let socket = Arc::new(bind_udp_socket(local_port).await?);
        let local_addr = socket.local_addr()?;
        info!("UDP listen on {}", local_addr);

        let settings = SessionSettings::from(config);
        let buffer_size = settings.buffer_size;
        let table = SessionTable::new(
            Arc::downgrade(&socket),
            upstream,
            settings,
            reporter.clone(),
        );

        let recv_cancel = CancellationToken::new();
        let recv_task = tokio::spawn(recv_loop(
            socket,
            table.clone(),
            buffer_size,
            reporter,
            recv_cancel.clone(),
        ));
        let sweep_task = tokio::spawn(table.clone().run_sweeper());

        Ok(UdpForwarder {
            local_addr,
            table,
            recv_cancel,
            recv_task: Mutex::new(Some(recv_task)),
            sweep_task: Mutex::new(Some(sweep_task)),
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listening socket.
    ///
    /// Returns once the socket is released. With [`StopPolicy::Drain`] the
    /// sessions keep relaying replies they can still deliver and the sweep
    /// keeps evicting them; with [`StopPolicy::Abort`] every session and the
    /// sweep end now.
    pub async fn stop(&self, policy: StopPolicy) {
        self.recv_cancel.cancel();
        match policy {
            StopPolicy::Drain => self.table.drain(),
            StopPolicy::Abort => self.table.abort_all(),
        }

        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("UDP receive task failed: {}", e);
            }
            info!("UDP listener on {} stopped", self.local_addr);
        }

        if policy == StopPolicy::Abort {
            let task = self.sweep_task.lock().take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
    }
}

impl Drop for UdpForwarder {
    fn drop(&mut self) {
        self.recv_cancel.cancel();
        self.table.drain();
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    table: Arc<SessionTable>,
    buffer_size: usize,
    reporter: ErrorReporter,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        let received = tokio::select! {
            // Expected shutdown: end silently
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => res,
        };

        match received {
            Ok((n, client)) => {
                // Sessions keep the payload past the next receive
                table.dispatch(client, Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                log_io_error("UDP receive", &e);
                reporter.report("udp receive", &e);
            }
        }
    }

    debug!("UDP receive loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn echo_server() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        port
    }

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_forwards_datagrams_per_client() {
        let upstream_port = echo_server().await;
        let port = free_port();
        let forwarder = UdpForwarder::start(
            port,
            UpstreamAddr::new("127.0.0.1", upstream_port),
            &UdpConfig::default(),
            ErrorReporter::noop(),
        )
        .await
        .unwrap();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(("127.0.0.1", port)).await.unwrap();
        b.connect(("127.0.0.1", port)).await.unwrap();

        a.send(b"from a").await.unwrap();
        assert_eq!(recv(&a).await, b"from a");
        b.send(b"from b").await.unwrap();
        assert_eq!(recv(&b).await, b"from b");

        assert_eq!(forwarder.table.len(), 2);
        forwarder.stop(StopPolicy::Abort).await;
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let port = free_port();
        let forwarder = UdpForwarder::start(
            port,
            UpstreamAddr::new("127.0.0.1", 9),
            &UdpConfig::default(),
            ErrorReporter::noop(),
        )
        .await
        .unwrap();
        assert_eq!(forwarder.local_addr().port(), port);

        forwarder.stop(StopPolicy::Drain).await;
        let rebound = UdpSocket::bind(("0.0.0.0", port)).await;
        assert!(rebound.is_ok());

        forwarder.stop(StopPolicy::Drain).await;
    }

    #[tokio::test]
    async fn test_abort_clears_sessions() {
        let upstream_port = echo_server().await;
        let port = free_port();
        let forwarder = UdpForwarder::start(
            port,
            UpstreamAddr::new("127.0.0.1", upstream_port),
            &UdpConfig::default(),
            ErrorReporter::noop(),
        )
        .await
        .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(("127.0.0.1", port)).await.unwrap();
        client.send(b"hello").await.unwrap();
        recv(&client).await;

        forwarder.stop(StopPolicy::Abort).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(forwarder.table.is_empty());
    }
}
