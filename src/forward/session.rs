//! UDP sessions and the session table
//!
//! UDP has no connections, so the forwarder fakes them NAT-style: every
//! client endpoint gets its own [`UdpSession`] with a private upstream
//! socket, and replies arriving on that socket go back to the one client
//! that owns it. Sessions are created lazily by [`SessionTable::get_or_create`]
//! and end on an upstream error, on a zero-length datagram, or when the
//! eviction sweep finds them idle past their deadline.

use crate::config::UdpConfig;
use crate::error::{log_io_error, ForwarderError, Result};
use crate::forward::ErrorReporter;
use crate::transport::{udp, UpstreamAddr};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timing and sizing for UDP sessions
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Inactivity after which a session is evicted
    pub idle_timeout: Duration,
    /// Pause between eviction sweeps
    pub sweep_interval: Duration,
    /// Upstream receive buffer size
    pub buffer_size: usize,
    /// Outbound datagrams queued per session
    pub queue_size: usize,
}

impl From<&UdpConfig> for SessionSettings {
    fn from(config: &UdpConfig) -> Self {
        SessionSettings {
            idle_timeout: config.idle_timeout(),
            sweep_interval: config.sweep_interval(),
            buffer_size: config.buffer_size,
            queue_size: config.queue_size,
        }
    }
}

/// Relay state for one client endpoint
#[derive(Debug)]
pub struct UdpSession {
    /// Unique id; tells apart successive sessions of the same client
    id: u64,
    /// Client endpoint this session answers to
    client: SocketAddr,
    /// FIFO of datagrams waiting for the upstream
    queue: mpsc::Sender<Bytes>,
    /// Reference point for `deadline_ms`
    epoch: Instant,
    /// Last-activity deadline, in milliseconds after `epoch`
    deadline_ms: AtomicU64,
    /// How far each activity pushes the deadline
    idle_timeout: Duration,
    /// Local address of the upstream socket, once dialed
    upstream_local: Mutex<Option<SocketAddr>>,
    /// Set exactly once when the session ends
    closed: AtomicBool,
    /// Stops the session task
    cancel: CancellationToken,
}

impl UdpSession {
    fn new(
        id: u64,
        client: SocketAddr,
        settings: &SessionSettings,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (queue, rx) = mpsc::channel(settings.queue_size);
        let session = Arc::new(UdpSession {
            id,
            client,
            queue,
            epoch: Instant::now(),
            deadline_ms: AtomicU64::new(duration_ms(settings.idle_timeout)),
            idle_timeout: settings.idle_timeout,
            upstream_local: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel,
        });
        (session, rx)
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Client endpoint
    pub fn client(&self) -> SocketAddr {
        self.client
    }

    /// Local address of the upstream socket, if the dial has completed
    pub fn upstream_local_addr(&self) -> Option<SocketAddr> {
        *self.upstream_local.lock()
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Push the idle deadline out by the idle timeout
    pub fn touch(&self) {
        let deadline =
            duration_ms(self.epoch.elapsed()).saturating_add(duration_ms(self.idle_timeout));
        self.deadline_ms.store(deadline, Ordering::Release);
    }

    /// Whether the idle deadline has passed at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        let elapsed = duration_ms(now.saturating_duration_since(self.epoch));
        elapsed >= self.deadline_ms.load(Ordering::Acquire)
    }

    /// Queue a datagram for the upstream.
    ///
    /// The payload must already be a private copy. A zero-length datagram
    /// ends the session.
    pub fn handle(&self, data: Bytes) {
        if self.is_closed() {
            return;
        }
        if data.is_empty() {
            debug!("UDP session {} got empty datagram, closing", self.id);
            // Closed sessions are replaced by the next get_or_create
            self.close();
            return;
        }
        match self.queue.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("UDP session {} queue full, dropping datagram", self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Mark the session closed without touching the table.
    ///
    /// Returns true only for the first caller.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Session task: dial, then pump both directions until something ends it
    async fn run(self: Arc<Self>, rx: mpsc::Receiver<Bytes>, table: Arc<SessionTable>) {
        let result = tokio::select! {
            res = self.relay(rx, &table) => res,
            _ = self.cancel.cancelled() => Ok(()),
        };

        match &result {
            Ok(()) => {}
            Err(e) if e.is_listener_closed() => {
                debug!("UDP session {} listener gone", self.id)
            }
            Err(ForwarderError::TransientIo(io)) => {
                log_io_error(&format!("UDP session {} relay", self.id), io)
            }
            Err(other) => {
                warn!("UDP session {} failed: {}", self.id, other);
                table.reporter.report("udp session", other);
            }
        }

        // No-op for sessions the sweep already evicted
        self.close();
        table.remove(&self);
    }

    async fn relay(&self, mut rx: mpsc::Receiver<Bytes>, table: &SessionTable) -> Result<()> {
        let upstream = udp::connect(&table.upstream).await?;
        *self.upstream_local.lock() = upstream.local_addr().ok();
        self.touch();
        debug!(
            "UDP session {} for {} dialed {} via {:?}",
            self.id,
            self.client,
            table.upstream,
            self.upstream_local_addr()
        );

        let send_pump = async {
            // One datagram in flight at a time, oldest first
            while let Some(data) = rx.recv().await {
                upstream
                    .send(&data)
                    .await
                    .map_err(ForwarderError::TransientIo)?;
                self.touch();
            }
            Ok::<(), ForwarderError>(())
        };

        let recv_pump = async {
            let mut buf = vec![0u8; table.settings.buffer_size];
            loop {
                let n = upstream
                    .recv(&mut buf)
                    .await
                    .map_err(ForwarderError::TransientIo)?;
                if n == 0 {
                    debug!("UDP session {} got empty datagram from upstream", self.id);
                    return Ok::<(), ForwarderError>(());
                }
                let listener = table.listener.upgrade().ok_or(ForwarderError::ListenerClosed)?;
                listener
                    .send_to(&buf[..n], self.client)
                    .await
                    .map_err(ForwarderError::TransientIo)?;
                self.touch();
            }
        };

        tokio::select! {
            res = send_pump => res,
            res = recv_pump => res,
        }
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`
fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Map from client endpoint to its live session
pub struct SessionTable {
    /// Live sessions
    sessions: Mutex<HashMap<SocketAddr, Arc<UdpSession>>>,
    /// Shared listener socket, used for replies to clients
    listener: Weak<UdpSocket>,
    /// Upstream target
    upstream: UpstreamAddr,
    /// Timing and sizing
    settings: SessionSettings,
    /// Hook for faults that end a session
    reporter: ErrorReporter,
    /// Parent of every session's token
    sessions_cancel: CancellationToken,
    /// Stops the sweep loop
    sweep_cancel: CancellationToken,
    /// Set by a draining stop: the sweep ends once the table is empty
    draining: AtomicBool,
    /// Source of session ids
    next_id: AtomicU64,
}

impl SessionTable {
    /// Create an empty table
    pub fn new(
        listener: Weak<UdpSocket>,
        upstream: UpstreamAddr,
        settings: SessionSettings,
        reporter: ErrorReporter,
    ) -> Arc<Self> {
        Arc::new(SessionTable {
            sessions: Mutex::new(HashMap::new()),
            listener,
            upstream,
            settings,
            reporter,
            sessions_cancel: CancellationToken::new(),
            sweep_cancel: CancellationToken::new(),
            draining: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Session currently registered for `client`
    pub fn get(&self, client: &SocketAddr) -> Option<Arc<UdpSession>> {
        self.sessions.lock().get(client).cloned()
    }

    /// Return the session for `client`, creating and starting one if needed.
    ///
    /// Lookup and insertion happen under one lock, so two datagrams racing
    /// from a new client still end up in the same session.
    pub fn get_or_create(self: &Arc<Self>, client: SocketAddr) -> Arc<UdpSession> {
        let (session, rx) = {
            let mut sessions = self.sessions.lock();
            match sessions.entry(client) {
                Entry::Occupied(entry) if !entry.get().is_closed() => {
                    return entry.get().clone();
                }
                entry => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (session, rx) = UdpSession::new(
                        id,
                        client,
                        &self.settings,
                        self.sessions_cancel.child_token(),
                    );
                    match entry {
                        Entry::Occupied(mut e) => {
                            e.insert(session.clone());
                        }
                        Entry::Vacant(e) => {
                            e.insert(session.clone());
                        }
                    }
                    (session, rx)
                }
            }
        };

        debug!("UDP session {} created for {}", session.id, client);
        tokio::spawn(session.clone().run(rx, self.clone()));
        session
    }

    /// Route one datagram from `client`
    pub fn dispatch(self: &Arc<Self>, client: SocketAddr, data: Bytes) {
        self.get_or_create(client).handle(data);
    }

    /// Remove `session` from the table.
    ///
    /// Only the exact instance is removed, so a late removal never evicts a
    /// newer session registered under the same client endpoint.
    pub fn remove(&self, session: &UdpSession) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(&session.client) {
            Some(current) if current.id == session.id => {
                sessions.remove(&session.client);
                debug!("UDP session {} removed", session.id);
                true
            }
            _ => false,
        }
    }

    /// Evict every session whose deadline has passed.
    ///
    /// Evicted sessions are taken out of the table first and then closed
    /// through the silent path, which does not call back into the table.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<UdpSession>> = {
            let mut sessions = self.sessions.lock();
            let keys: Vec<SocketAddr> = sessions
                .iter()
                .filter(|(_, session)| session.is_expired(now))
                .map(|(client, _)| *client)
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };

        for session in &expired {
            debug!(
                "UDP session {} expired (upstream local {:?})",
                session.id,
                session.upstream_local_addr()
            );
            session.close();
        }
        expired.len()
    }

    /// Periodic eviction loop.
    ///
    /// Sleeps a full interval after each scan, so scans never overlap.
    pub async fn run_sweeper(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.sweep_cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.sweep_interval) => {}
            }

            let evicted = self.sweep();
            if evicted > 0 {
                debug!("UDP sweep evicted {} sessions", evicted);
            }
            if self.draining.load(Ordering::Acquire) && self.is_empty() {
                break;
            }
        }
        debug!("UDP sweep loop ended");
    }

    /// Let sessions run out on their own; the sweep ends once all are gone
    pub fn drain(&self) {
        self.draining.store(true, Ordering::Release);
        if self.is_empty() {
            self.sweep_cancel.cancel();
        }
    }

    /// Abort every session and stop the sweep
    pub fn abort_all(&self) {
        self.sessions_cancel.cancel();
        self.sweep_cancel.cancel();
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("upstream", &self.upstream)
            .field("sessions", &self.len())
            .finish()
    }
}
