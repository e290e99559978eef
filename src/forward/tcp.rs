//! TCP listener
//!
//! Accepts inbound connections on the local port and hands each one to a
//! freshly spawned [`TcpPipe`]. The accept loop never waits on session setup.

use super::pipe::{PipeSettings, TcpPipe};
use crate::config::{StopPolicy, TcpConfig};
use crate::error::{log_io_error, Result};
use crate::forward::ErrorReporter;
use crate::transport::{bind_tcp_listener, SocketOpts, UpstreamAddr};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pause before retrying a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Running TCP listener
#[derive(Debug)]
pub struct TcpForwarder {
    /// Bound address
    local_addr: SocketAddr,
    /// Stops the accept loop
    accept_cancel: CancellationToken,
    /// Parent of every session's token
    sessions_cancel: CancellationToken,
    /// Accept loop task; owns the listening socket
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpForwarder {
    /// Bind `local_port` and start accepting
    pub async fn start(
        local_port: u16,
        upstream: UpstreamAddr,
        config: &TcpConfig,
        reporter: ErrorReporter,
    ) -> Result<Self> {
        let listener = bind_tcp_listener(local_port, config.backlog).await?;
        let local_addr = listener.local_addr()?;
        info!("TCP listen on {}", local_addr);

        let settings = PipeSettings {
            upstream,
            socket_opts: SocketOpts::from_tcp_config(config),
            buffer_size: config.buffer_size,
        };

        let accept_cancel = CancellationToken::new();
        let sessions_cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            settings,
            reporter,
            accept_cancel.clone(),
            sessions_cancel.clone(),
        ));

        Ok(TcpForwarder {
            local_addr,
            accept_cancel,
            sessions_cancel,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listening socket.
    ///
    /// Returns once the socket is released. With [`StopPolicy::Abort`]
    /// every in-flight session is aborted as well.
    pub async fn stop(&self, policy: StopPolicy) {
        self.accept_cancel.cancel();
        if policy == StopPolicy::Abort {
            self.sessions_cancel.cancel();
        }

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("TCP accept task failed: {}", e);
            }
            info!("TCP listener on {} stopped", self.local_addr);
        }
    }
}

impl Drop for TcpForwarder {
    fn drop(&mut self) {
        self.accept_cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    settings: PipeSettings,
    reporter: ErrorReporter,
    accept_cancel: CancellationToken,
    sessions_cancel: CancellationToken,
) {
    let next_id = AtomicU64::new(1);

    loop {
        let accepted = tokio::select! {
            // Expected shutdown: end silently
            _ = accept_cancel.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, peer)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                debug!("TCP session {} accepted from {}", id, peer);

                let pipe = TcpPipe::new(id, peer, sessions_cancel.child_token());
                tokio::spawn(pipe.run(stream, settings.clone(), reporter.clone()));
            }
            Err(e) => {
                log_io_error("TCP accept", &e);
                reporter.report("tcp accept", &e);
                if !pause_after_error(&accept_cancel).await {
                    break;
                }
            }
        }
    }

    debug!("TCP accept loop ended");
}

/// Wait out [`ACCEPT_ERROR_DELAY`]; false if the loop was cancelled meanwhile
async fn pause_after_error(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_DELAY) => true,
    }
}
