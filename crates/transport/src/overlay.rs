//! Capability adapters over the overlay client and the NAT traversal session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use meshtunnel_core::{AcceptAddrs, DialConfig, Result};

use crate::capability::{Dialer, Listener};
use crate::conn::{Accepted, BoxStream, DatagramConn, DatagramSession};
use crate::provider::{NatSessionClient, OverlayClient};

/// Client handle shared by several adapters.
///
/// The underlying `close` runs for the first caller only; later calls return
/// `Ok(())` without reaching the wrapped client.
pub struct CloseOnce<T: ?Sized> {
    inner: Arc<T>,
    closed: AtomicBool,
}

impl<T: ?Sized> CloseOnce<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self {
            inner,
            closed: AtomicBool::new(false),
        }
    }

    /// `true` for the caller that gets to close
    fn claim(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

#[async_trait]
impl OverlayClient for CloseOnce<dyn OverlayClient> {
    fn addr(&self) -> String {
        self.inner.addr()
    }

    async fn wait_connected(&self) -> Result<()> {
        self.inner.wait_connected().await
    }

    async fn dial(&self, addr: &str, config: &DialConfig) -> Result<BoxStream> {
        self.inner.dial(addr, config).await
    }

    async fn listen(&self, filter: Option<AcceptAddrs>) -> Result<()> {
        self.inner.listen(filter).await
    }

    async fn accept(&self) -> Result<Accepted> {
        self.inner.accept().await
    }

    async fn close(&self) -> Result<()> {
        if !self.claim() {
            return Ok(());
        }
        self.inner.close().await
    }
}

#[async_trait]
impl NatSessionClient for CloseOnce<dyn NatSessionClient> {
    fn addr(&self) -> String {
        self.inner.addr()
    }

    async fn dial(&self, addr: &str, config: &DialConfig) -> Result<BoxStream> {
        self.inner.dial(addr, config).await
    }

    async fn dial_udp(&self, addr: &str, config: &DialConfig) -> Result<Arc<dyn DatagramSession>> {
        self.inner.dial_udp(addr, config).await
    }

    async fn listen(&self, filter: Option<AcceptAddrs>) -> Result<()> {
        self.inner.listen(filter).await
    }

    async fn accept(&self) -> Result<Accepted> {
        self.inner.accept().await
    }

    async fn listen_udp(&self, filter: Option<AcceptAddrs>) -> Result<Arc<dyn DatagramConn>> {
        self.inner.listen_udp(filter).await
    }

    fn public_addrs(&self) -> Vec<String> {
        self.inner.public_addrs()
    }

    async fn close(&self) -> Result<()> {
        if !self.claim() {
            return Ok(());
        }
        self.inner.close().await
    }
}

/// Dialer over the bare overlay client (streams only)
pub struct OverlayDialer {
    client: Arc<dyn OverlayClient>,
    closed: AtomicBool,
}

impl OverlayDialer {
    pub fn new(client: Arc<dyn OverlayClient>) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Dialer for OverlayDialer {
    fn addr(&self) -> Option<String> {
        Some(self.client.addr())
    }

    async fn dial(&self, addr: &str, config: &DialConfig) -> Result<BoxStream> {
        self.client.dial(addr, config).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing overlay dialer {}", self.client.addr());
        self.client.close().await
    }
}

/// Listener accepting overlay sessions
pub struct OverlayListener {
    client: Arc<dyn OverlayClient>,
    closed: AtomicBool,
}

impl OverlayListener {
    /// Start listening with the given allow-list
    pub async fn listen(
        client: Arc<dyn OverlayClient>,
        filter: Option<AcceptAddrs>,
    ) -> Result<Self> {
        client.listen(filter).await?;
        Ok(Self {
            client,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Listener for OverlayListener {
    fn addr(&self) -> String {
        self.client.addr()
    }

    async fn accept(&self) -> Result<Accepted> {
        self.client.accept().await
    }

    async fn install(&self, filter: Option<AcceptAddrs>) -> Result<()> {
        self.client.listen(filter).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.close().await
    }
}

/// Dialer over the NAT traversal session client (streams and datagrams)
pub struct SessionDialer {
    session: Arc<dyn NatSessionClient>,
    /// Overlay client the session rides on, closed along with it
    client: Option<Arc<dyn OverlayClient>>,
    closed: AtomicBool,
}

impl SessionDialer {
    pub fn new(session: Arc<dyn NatSessionClient>) -> Self {
        Self {
            session,
            client: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Also close `client` when this dialer closes
    pub fn with_client(mut self, client: Arc<dyn OverlayClient>) -> Self {
        self.client = Some(client);
        self
    }
}

#[async_trait]
impl Dialer for SessionDialer {
    fn addr(&self) -> Option<String> {
        Some(self.session.addr())
    }

    async fn dial(&self, addr: &str, config: &DialConfig) -> Result<BoxStream> {
        self.session.dial(addr, config).await
    }

    async fn dial_udp(&self, addr: &str, config: &DialConfig) -> Result<Arc<dyn DatagramSession>> {
        self.session.dial_udp(addr, config).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing NAT session dialer {}", self.session.addr());
        let session = self.session.close().await;
        let client = match &self.client {
            Some(client) => client.close().await,
            None => Ok(()),
        };
        session.and(client)
    }
}

/// Listener accepting NAT traversal sessions
pub struct SessionListener {
    session: Arc<dyn NatSessionClient>,
    filter: Mutex<Option<AcceptAddrs>>,
    closed: AtomicBool,
}

impl SessionListener {
    /// Start listening with the given allow-list
    pub async fn listen(
        session: Arc<dyn NatSessionClient>,
        filter: Option<AcceptAddrs>,
    ) -> Result<Self> {
        session.listen(filter.clone()).await?;
        Ok(Self {
            session,
            filter: Mutex::new(filter),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Listener for SessionListener {
    fn addr(&self) -> String {
        self.session.addr()
    }

    async fn accept(&self) -> Result<Accepted> {
        self.session.accept().await
    }

    async fn install(&self, filter: Option<AcceptAddrs>) -> Result<()> {
        self.session.listen(filter.clone()).await?;
        *self.filter.lock() = filter;
        Ok(())
    }

    async fn listen_udp(&self) -> Result<Arc<dyn DatagramConn>> {
        let filter = self.filter.lock().clone();
        self.session.listen_udp(filter).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.close().await
    }
}
