//! Dialer and Listener capability contracts
//!
//! The relay only ever talks to these two traits. Which adapter sits behind
//! them (overlay client, NAT traversal session, plain socket) is decided once
//! when a tunnel is built.

use std::sync::Arc;

use async_trait::async_trait;

use meshtunnel_core::{AcceptAddrs, DialConfig, Result, TunnelError};

use crate::conn::{Accepted, BoxStream, DatagramConn, DatagramSession};

/// Outbound half of a transport.
///
/// `close` is idempotent: only the first call reaches the underlying client.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Overlay identity, `None` for plain sockets
    fn addr(&self) -> Option<String>;

    async fn dial(&self, addr: &str, config: &DialConfig) -> Result<BoxStream>;

    /// Transports without datagram support keep the default.
    async fn dial_udp(
        &self,
        _addr: &str,
        _config: &DialConfig,
    ) -> Result<Arc<dyn DatagramSession>> {
        Err(TunnelError::UdpUnsupported)
    }

    async fn close(&self) -> Result<()>;
}

/// Inbound half of a transport.
///
/// After `close`, a pending or future `accept` fails with
/// [`TunnelError::ListenerClosed`].
#[async_trait]
pub trait Listener: Send + Sync {
    /// Address peers reach this listener on
    fn addr(&self) -> String;

    async fn accept(&self) -> Result<Accepted>;

    /// (Re)install the allow-list of peer identities; `None` accepts all.
    async fn install(&self, filter: Option<AcceptAddrs>) -> Result<()>;

    /// Open the datagram side of this listener.
    async fn listen_udp(&self) -> Result<Arc<dyn DatagramConn>> {
        Err(TunnelError::UdpUnsupported)
    }

    async fn close(&self) -> Result<()>;
}
