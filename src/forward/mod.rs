//! Forwarding engine
//!
//! A [`Forwarder`] binds one TCP listener and one UDP listener on the same
//! local port and relays both to a single upstream target.

mod pipe;
mod report;
mod session;
mod tcp;
mod udp;

pub use pipe::{PipeSettings, PipeState, Side, TcpPipe};
pub use report::{ErrorReport, ErrorReporter};
pub use session::{SessionSettings, SessionTable, UdpSession};
pub use tcp::TcpForwarder;
pub use udp::UdpForwarder;

use crate::config::{Config, StopPolicy, TargetDescriptor};
use crate::error::{ForwarderError, Result};
use crate::transport::UpstreamAddr;
use tracing::info;

/// TCP and UDP listeners serving one target
#[derive(Debug)]
pub struct Forwarder {
    /// Target being served
    target: TargetDescriptor,
    /// TCP listener
    tcp: TcpForwarder,
    /// UDP listener
    udp: UdpForwarder,
    /// Applied by `stop()`
    stop_policy: StopPolicy,
}

impl Forwarder {
    /// Start forwarding `target`.
    ///
    /// All or nothing: on error no listener is left bound. The target is
    /// resolved up front, so an unresolvable address fails here rather than
    /// in every session.
    pub async fn start(
        target: TargetDescriptor,
        config: &Config,
        reporter: ErrorReporter,
    ) -> Result<Self> {
        target.validate().map_err(ForwarderError::Config)?;
        config.tcp.validate().map_err(ForwarderError::Config)?;
        config.udp.validate().map_err(ForwarderError::Config)?;

        let upstream = UpstreamAddr::from_target(&target);
        let resolved = upstream.resolve().await?;
        info!("Forwarding port {} to {}", target.local_port, resolved);

        let tcp = TcpForwarder::start(
            target.local_port,
            upstream.clone(),
            &config.tcp,
            reporter.clone(),
        )
        .await?;

        let udp = match UdpForwarder::start(target.local_port, upstream, &config.udp, reporter)
            .await
        {
            Ok(udp) => udp,
            Err(e) => {
                tcp.stop(StopPolicy::Abort).await;
                return Err(e);
            }
        };

        Ok(Forwarder {
            target,
            tcp,
            udp,
            stop_policy: config.forwarder.stop_policy,
        })
    }

    /// Target being served
    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// Local port both listeners are bound to
    pub fn local_port(&self) -> u16 {
        self.target.local_port
    }

    /// Stop policy applied by [`Forwarder::stop`]
    pub fn stop_policy(&self) -> StopPolicy {
        self.stop_policy
    }

    /// Stop both listeners with the configured policy.
    ///
    /// Returns once the local port is free again. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.stop_with(self.stop_policy).await;
    }

    /// Stop both listeners with an explicit policy
    pub async fn stop_with(&self, policy: StopPolicy) {
        self.tcp.stop(policy).await;
        self.udp.stop(policy).await;
        info!("Forwarder on port {} stopped", self.target.local_port);
    }
}
