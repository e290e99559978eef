//! Upstream TCP dialing
//!
//! Opens the outbound half of a TCP session. No connect timeout is applied;
//! a dial is bounded only by the operating system's connect timeout.

use super::{SocketOpts, UpstreamAddr};
use crate::error::Result;
use tokio::net::TcpStream;

/// Connect to the upstream target and apply socket options
pub async fn connect(addr: &UpstreamAddr, opts: &SocketOpts) -> Result<TcpStream> {
    let resolved = addr.resolve().await?;

    let stream = TcpStream::connect(resolved).await?;
    opts.apply(&stream)?;

    tracing::debug!("TCP connection established to {}", resolved);

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForwarderError;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_sets_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = UpstreamAddr::new("127.0.0.1", port);
        let opts = SocketOpts::default();

        let (stream, accepted) = tokio::join!(connect(&addr, &opts), listener.accept());
        let stream = stream.unwrap();
        assert!(accepted.is_ok());
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening on it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let addr = UpstreamAddr::new("127.0.0.1", port);

        let result = connect(&addr, &SocketOpts::default()).await;
        assert!(matches!(result, Err(ForwarderError::Io(_))));
    }

    #[tokio::test]
    async fn test_connect_unresolvable() {
        let addr = UpstreamAddr::new("nonexistent.invalid", 80);
        let result = connect(&addr, &SocketOpts::default()).await;
        assert!(matches!(result, Err(ForwarderError::TargetResolution(_))));
    }
}
