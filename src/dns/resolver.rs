//! Upstream resolver bridge.
//!
//! Allowed queries are forwarded byte-for-byte to the real resolver over a
//! socket that the tunnel has protected, so the query does not loop back
//! into the tunnel.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::{Result, UpstreamError};
use crate::network::SocketProtector;

/// Receive buffer for upstream replies.
pub const MAX_UPSTREAM_REPLY_SIZE: usize = 4096;

/// Trait for forwarding raw DNS queries.
pub trait UpstreamResolver: Send + Sync + Clone + 'static {
    /// Send `query` and return the reply exactly as received.
    fn resolve(&self, query: &[u8]) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Forwards queries over UDP, one fresh protected socket per query.
pub struct UdpUpstream<P> {
    server: SocketAddr,
    timeout: Duration,
    protector: Arc<P>,
}

impl<P: SocketProtector> UdpUpstream<P> {
    pub const fn new(server: SocketAddr, timeout: Duration, protector: Arc<P>) -> Self {
        Self {
            server,
            timeout,
            protector,
        }
    }

    async fn exchange(&self, query: &[u8]) -> std::result::Result<Vec<u8>, UpstreamError> {
        let local: SocketAddr = match self.server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await.map_err(UpstreamError::Bind)?;
        self.protector
            .protect(&socket)
            .map_err(UpstreamError::Protect)?;
        socket
            .connect(self.server)
            .await
            .map_err(UpstreamError::from_io)?;
        socket.send(query).await.map_err(UpstreamError::from_io)?;

        let mut reply = vec![0u8; MAX_UPSTREAM_REPLY_SIZE];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut reply))
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))?
            .map_err(UpstreamError::from_io)?;
        reply.truncate(len);

        trace!(server = %self.server, len, "upstream replied");
        Ok(reply)
    }
}

impl<P: SocketProtector> Clone for UdpUpstream<P> {
    fn clone(&self) -> Self {
        Self {
            server: self.server,
            timeout: self.timeout,
            protector: Arc::clone(&self.protector),
        }
    }
}

impl<P: SocketProtector> UpstreamResolver for UdpUpstream<P> {
    async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>> {
        Ok(self.exchange(query).await?)
    }
}
