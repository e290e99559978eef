//! Upstream address resolution with caching
//!
//! The target of a forwarder never changes while it runs, so the resolved
//! socket address is computed once and reused by every session instead of
//! blocking each new connection on a DNS lookup.

use crate::config::TargetDescriptor;
use crate::error::{ForwarderError, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Upstream address that caches its resolved socket address
#[derive(Debug, Clone)]
pub struct UpstreamAddr {
    /// Host name or literal IP
    host: String,
    /// Upstream port
    port: u16,
    /// Cached resolved address
    cached: Arc<RwLock<Option<SocketAddr>>>,
}

impl UpstreamAddr {
    /// Create a new address without cached resolution
    pub fn new(host: &str, port: u16) -> Self {
        UpstreamAddr {
            host: host.trim().to_string(),
            port,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// Create the upstream address of a target
    pub fn from_target(target: &TargetDescriptor) -> Self {
        UpstreamAddr::new(&target.address, target.server_port)
    }

    /// Get the host part
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the upstream port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the cached address if available
    pub async fn get_cached(&self) -> Option<SocketAddr> {
        *self.cached.read().await
    }

    /// Resolve the address, using cache if available
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Some(cached) = self.get_cached().await {
            return Ok(cached);
        }

        let resolved = self.resolve_fresh().await?;
        *self.cached.write().await = Some(resolved);

        Ok(resolved)
    }

    /// Resolve the address without using cache.
    ///
    /// A literal IP is used as is; otherwise the first IPv4 address returned
    /// by the system resolver wins.
    pub async fn resolve_fresh(&self) -> Result<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        if self.host.is_empty() {
            return Err(ForwarderError::TargetResolution(
                "empty server address".to_string(),
            ));
        }

        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| ForwarderError::TargetResolution(format!("{}: {}", self.host, e)))?;

        addrs
            .into_iter()
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| {
                ForwarderError::TargetResolution(format!("{}: no IPv4 address", self.host))
            })
    }
}

impl std::fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
