//! External collaborator contracts
//!
//! The overlay multi-path client and the NAT traversal session client live
//! outside this workspace. These traits are the surface the relay consumes
//! from them; an embedding application supplies an [`OverlayProvider`] that
//! knows how to build both.

use std::sync::Arc;

use async_trait::async_trait;

use meshtunnel_core::{AcceptAddrs, Account, DialConfig, Result, TunnelConfig};

use crate::conn::{Accepted, BoxStream, DatagramConn, DatagramSession};

/// Multi-path overlay client bound to one identity
#[async_trait]
pub trait OverlayClient: Send + Sync {
    /// Full overlay address (`identifier.pubkey`)
    fn addr(&self) -> String;

    /// Resolves once the client has connected to the network for the first time
    async fn wait_connected(&self) -> Result<()>;

    async fn dial(&self, addr: &str, config: &DialConfig) -> Result<BoxStream>;

    /// Start (or re-filter) accepting sessions
    async fn listen(&self, filter: Option<AcceptAddrs>) -> Result<()>;

    async fn accept(&self) -> Result<Accepted>;

    /// Idempotent; unblocks a pending `accept`
    async fn close(&self) -> Result<()>;
}

/// NAT traversal session client layered over an [`OverlayClient`]
#[async_trait]
pub trait NatSessionClient: Send + Sync {
    fn addr(&self) -> String;

    async fn dial(&self, addr: &str, config: &DialConfig) -> Result<BoxStream>;

    async fn dial_udp(&self, addr: &str, config: &DialConfig)
        -> Result<Arc<dyn DatagramSession>>;

    async fn listen(&self, filter: Option<AcceptAddrs>) -> Result<()>;

    async fn accept(&self) -> Result<Accepted>;

    async fn listen_udp(&self, filter: Option<AcceptAddrs>) -> Result<Arc<dyn DatagramConn>>;

    /// Public addresses discovered through the traversal service
    fn public_addrs(&self) -> Vec<String>;

    /// Idempotent; unblocks a pending `accept`
    async fn close(&self) -> Result<()>;
}

/// Factory for the external clients
#[async_trait]
pub trait OverlayProvider: Send + Sync {
    async fn connect_client(
        &self,
        account: &Account,
        identifier: &str,
        config: &TunnelConfig,
    ) -> Result<Arc<dyn OverlayClient>>;

    /// `config.effective_nat()` and `config.wallet` carry the session settings.
    async fn connect_session(
        &self,
        account: &Account,
        client: Arc<dyn OverlayClient>,
        config: &TunnelConfig,
    ) -> Result<Arc<dyn NatSessionClient>>;
}
