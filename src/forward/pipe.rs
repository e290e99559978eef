//! TCP session (pipe)
//!
//! One [`TcpPipe`] exists per accepted connection. It dials the upstream,
//! then runs two pumps, one per direction. Each pump is a straight-line
//! read-then-write loop, so there is never more than one read and one write
//! outstanding per socket per direction.
//!
//! ```text
//! Connecting ──► Piping ──► HalfClosedLocal ──┐
//!     │             │   └─► HalfClosedRemote ─┴─► Closed
//!     └─────────────┴──────── (error / abort) ──► Closed
//! ```

use crate::error::{log_io_error, ForwarderError};
use crate::forward::ErrorReporter;
use crate::transport::{self, tcp, SocketOpts, UpstreamAddr};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle of a TCP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Dialing the upstream
    Connecting,
    /// Relaying in both directions
    Piping,
    /// The local peer sent EOF; upstream→local still flows
    HalfClosedLocal,
    /// The upstream sent EOF; local→upstream still flows
    HalfClosedRemote,
    /// Torn down
    Closed,
}

/// Which peer a pump reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted inbound connection
    Local,
    /// The upstream connection
    Remote,
}

/// Shared settings for every pipe spawned by one listener
#[derive(Debug, Clone)]
pub struct PipeSettings {
    /// Upstream target
    pub upstream: UpstreamAddr,
    /// Options applied to the upstream socket
    pub socket_opts: SocketOpts,
    /// Per-direction buffer size
    pub buffer_size: usize,
}

/// A single relayed TCP connection
#[derive(Debug)]
pub struct TcpPipe {
    /// Session id, for logs
    id: u64,
    /// Address of the inbound peer
    peer: SocketAddr,
    /// Current state
    state: Mutex<PipeState>,
    /// Set exactly once by whoever tears the session down
    closed: AtomicBool,
    /// Fired on abort; both pumps stop at their next await point
    cancel: CancellationToken,
}

impl TcpPipe {
    /// Create a new pipe in the `Connecting` state
    pub fn new(id: u64, peer: SocketAddr, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(TcpPipe {
            id,
            peer,
            state: Mutex::new(PipeState::Connecting),
            closed: AtomicBool::new(false),
            cancel,
        })
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> PipeState {
        *self.state.lock()
    }

    /// Whether the session has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Abort the session from outside (e.g. listener stop with abort policy)
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    fn set_piping(&self) {
        let mut state = self.state.lock();
        if *state == PipeState::Connecting {
            *state = PipeState::Piping;
        }
    }

    /// Record that `side` sent EOF.
    ///
    /// Returns true once both directions have ended.
    pub fn mark_eof(&self, side: Side) -> bool {
        let mut state = self.state.lock();
        let next = match (*state, side) {
            (PipeState::Piping, Side::Local) => PipeState::HalfClosedLocal,
            (PipeState::Piping, Side::Remote) => PipeState::HalfClosedRemote,
            (PipeState::HalfClosedLocal, Side::Remote)
            | (PipeState::HalfClosedRemote, Side::Local) => PipeState::Closed,
            (current, _) => current,
        };
        *state = next;
        next == PipeState::Closed
    }

    /// Mark the session closed.
    ///
    /// Returns true only for the first caller; that caller owns teardown.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.state.lock() = PipeState::Closed;
        self.cancel.cancel();
        true
    }

    /// Dial upstream and relay until both sides finish, an error occurs, or
    /// the session is aborted.
    pub async fn run(
        self: Arc<Self>,
        mut local: TcpStream,
        settings: PipeSettings,
        reporter: ErrorReporter,
    ) {
        let dialed = tokio::select! {
            res = tcp::connect(&settings.upstream, &settings.socket_opts) => Some(res),
            _ = self.cancel.cancelled() => None,
        };

        let mut upstream = match dialed {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                self.log_error("connect upstream", &e);
                reporter.report("tcp connect", &e);
                self.teardown(&local, None, true);
                return;
            }
            None => {
                self.teardown(&local, None, true);
                return;
            }
        };

        self.set_piping();
        debug!(
            "TCP session {} piping {} <-> {}",
            self.id, self.peer, settings.upstream
        );

        let result = {
            let (mut local_read, mut local_write) = local.split();
            let (mut upstream_read, mut upstream_write) = upstream.split();
            let mut local_buf = vec![0u8; settings.buffer_size];
            let mut upstream_buf = vec![0u8; settings.buffer_size];

            let outbound = self.pump(
                Side::Local,
                &mut local_read,
                &mut upstream_write,
                &mut local_buf,
            );
            let inbound = self.pump(
                Side::Remote,
                &mut upstream_read,
                &mut local_write,
                &mut upstream_buf,
            );

            tokio::select! {
                res = async { tokio::try_join!(outbound, inbound) } => res,
                _ = self.cancel.cancelled() => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "session aborted",
                )),
            }
        };

        match result {
            Ok((sent, received)) => {
                debug!(
                    "TCP session {} finished: {} bytes up, {} bytes down",
                    self.id, sent, received
                );
                self.teardown(&local, Some(&upstream), false);
            }
            Err(e) => {
                log_io_error(&format!("TCP session {} relay", self.id), &e);
                self.teardown(&local, Some(&upstream), true);
            }
        }
    }

    /// Relay one direction until EOF or error
    async fn pump<R, W>(
        &self,
        side: Side,
        reader: &mut R,
        writer: &mut W,
        buf: &mut [u8],
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;
        loop {
            let n = reader.read(buf).await?;
            if n == 0 {
                // Propagate the half-close to the other peer
                writer.shutdown().await?;
                if self.mark_eof(side) {
                    debug!("TCP session {} both directions ended", self.id);
                }
                return Ok(total);
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }

    /// Close both sockets; runs at most once per session
    fn teardown(&self, local: &TcpStream, upstream: Option<&TcpStream>, abort: bool) {
        if !self.close() {
            return;
        }
        if abort {
            for stream in std::iter::once(local).chain(upstream) {
                if let Err(e) = transport::set_abortive_close(stream) {
                    log_io_error(&format!("TCP session {} abort", self.id), &e);
                }
            }
        }
        debug!("TCP session {} closed ({})", self.id, self.peer);
    }

    fn log_error(&self, context: &str, err: &ForwarderError) {
        match err {
            ForwarderError::Io(e) | ForwarderError::TransientIo(e) => {
                log_io_error(&format!("TCP session {} {}", self.id, context), e)
            }
            other => tracing::warn!("TCP session {} {}: {}", self.id, context, other),
        }
    }
}
