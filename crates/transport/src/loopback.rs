//! In-process overlay network
//!
//! `LoopbackOverlay` implements the collaborator contracts without any real
//! routing: every client registers in a shared in-memory table, streams are
//! `tokio::io::duplex` pairs and datagrams travel over bounded channels.
//! Accept-address filters are enforced against the dialer's address. It backs
//! the test suites and local demos.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use meshtunnel_core::{
    accepts, AcceptAddrs, Account, DialConfig, Result, TunnelConfig, TunnelError,
};

use crate::conn::{Accepted, BoxStream, DatagramConn, DatagramSession, PeerAddr};
use crate::provider::{NatSessionClient, OverlayClient, OverlayProvider};
use crate::shutdown::Shutdown;

/// In-memory buffer of each direction of a loopback stream
const STREAM_BUFFER: usize = 64 * 1024;

/// Pending accepts queued per listener
const ACCEPT_BACKLOG: usize = 128;

/// Datagrams queued per receiver before new ones are dropped
const DATAGRAM_BACKLOG: usize = 1024;

type Datagram = (Vec<u8>, PeerAddr);

/// Stream listeners of the bare client and of NAT sessions are separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Plane {
    Client,
    Session,
}

struct StreamEndpoint {
    tx: mpsc::Sender<Accepted>,
    filter: Option<AcceptAddrs>,
}

struct DatagramEndpoint {
    tx: mpsc::Sender<Datagram>,
    filter: Option<AcceptAddrs>,
}

#[derive(Default)]
struct Network {
    clients: Mutex<HashSet<String>>,
    streams: Mutex<HashMap<(Plane, String), StreamEndpoint>>,
    datagrams: Mutex<HashMap<String, DatagramEndpoint>>,
    next_id: AtomicU64,
    stream_dials: AtomicU64,
    udp_dials: AtomicU64,
}

impl Network {
    fn listen(&self, plane: Plane, addr: &str, tx: mpsc::Sender<Accepted>, filter: Option<AcceptAddrs>) {
        self.streams
            .lock()
            .insert((plane, addr.to_string()), StreamEndpoint { tx, filter });
    }

    async fn connect(&self, plane: Plane, from: &str, to: &str) -> Result<BoxStream> {
        self.stream_dials.fetch_add(1, Ordering::Relaxed);
        let tx = {
            let streams = self.streams.lock();
            let endpoint = streams
                .get(&(plane, to.to_string()))
                .ok_or_else(|| TunnelError::Dial(format!("{}: unreachable", to)))?;
            if !accepts(endpoint.filter.as_ref(), from) {
                return Err(TunnelError::Dial(format!("{}: rejected {}", to, from)));
            }
            endpoint.tx.clone()
        };

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        tx.send(Accepted::new(remote, from))
            .await
            .map_err(|_| TunnelError::Dial(format!("{}: listener gone", to)))?;
        Ok(Box::new(local))
    }

    fn bind_datagram(&self, addr: &str, filter: Option<AcceptAddrs>) -> mpsc::Receiver<Datagram> {
        let (tx, rx) = mpsc::channel(DATAGRAM_BACKLOG);
        self.datagrams
            .lock()
            .insert(addr.to_string(), DatagramEndpoint { tx, filter });
        rx
    }

    fn deliver(&self, to: &str, payload: &[u8], from: PeerAddr) -> Result<usize> {
        let datagrams = self.datagrams.lock();
        let endpoint = datagrams
            .get(to)
            .ok_or_else(|| TunnelError::Dial(format!("{}: unreachable", to)))?;
        // A full receiver drops the datagram, as a congested link would.
        if endpoint.tx.try_send((payload.to_vec(), from)).is_err() {
            debug!("Dropped {} byte datagram to {}", payload.len(), to);
        }
        Ok(payload.len())
    }

    fn unbind(&self, addr: &str) {
        self.datagrams.lock().remove(addr);
    }

    fn close_plane(&self, plane: Plane, addr: &str) {
        self.streams.lock().remove(&(plane, addr.to_string()));
    }
}

/// Provider handing out clients attached to one shared in-memory network.
///
/// Clones share the network, so two "processes" in a test talk through
/// clones of the same value.
#[derive(Clone, Default)]
pub struct LoopbackOverlay {
    net: Arc<Network>,
}

impl LoopbackOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stream dials attempted on this network
    pub fn stream_dials(&self) -> u64 {
        self.net.stream_dials.load(Ordering::Relaxed)
    }

    /// Number of datagram sessions dialed on this network
    pub fn udp_dials(&self) -> u64 {
        self.net.udp_dials.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OverlayProvider for LoopbackOverlay {
    async fn connect_client(
        &self,
        account: &Account,
        identifier: &str,
        _config: &TunnelConfig,
    ) -> Result<Arc<dyn OverlayClient>> {
        let addr = account.address(identifier);
        if !self.net.clients.lock().insert(addr.clone()) {
            return Err(TunnelError::Client(format!("{} is already connected", addr)));
        }
        debug!("Loopback client {} connected", addr);
        Ok(Arc::new(LoopbackClient::new(addr, self.net.clone())))
    }

    async fn connect_session(
        &self,
        _account: &Account,
        client: Arc<dyn OverlayClient>,
        _config: &TunnelConfig,
    ) -> Result<Arc<dyn NatSessionClient>> {
        Ok(Arc::new(LoopbackSession::new(client.addr(), self.net.clone())))
    }
}

/// Accept queue shared by the client and session planes
struct AcceptQueue {
    tx: mpsc::Sender<Accepted>,
    rx: AsyncMutex<mpsc::Receiver<Accepted>>,
    shutdown: Shutdown,
}

impl AcceptQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            shutdown: Shutdown::new(),
        }
    }

    async fn accept(&self) -> Result<Accepted> {
        if self.shutdown.is_triggered() {
            return Err(TunnelError::ListenerClosed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            next = rx.recv() => next.ok_or(TunnelError::ListenerClosed),
            _ = self.shutdown.wait() => Err(TunnelError::ListenerClosed),
        }
    }
}

/// Loopback stand-in for the multi-path overlay client
pub struct LoopbackClient {
    addr: String,
    net: Arc<Network>,
    queue: AcceptQueue,
}

impl LoopbackClient {
    fn new(addr: String, net: Arc<Network>) -> Self {
        Self {
            addr,
            net,
            queue: AcceptQueue::new(),
        }
    }
}

#[async_trait]
impl OverlayClient for LoopbackClient {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn wait_connected(&self) -> Result<()> {
        if self.queue.shutdown.is_triggered() {
            return Err(TunnelError::Client(format!("{} is closed", self.addr)));
        }
        Ok(())
    }

    async fn dial(&self, addr: &str, _config: &DialConfig) -> Result<BoxStream> {
        if self.queue.shutdown.is_triggered() {
            return Err(TunnelError::DialerClosed);
        }
        self.net.connect(Plane::Client, &self.addr, addr).await
    }

    async fn listen(&self, filter: Option<AcceptAddrs>) -> Result<()> {
        self.net
            .listen(Plane::Client, &self.addr, self.queue.tx.clone(), filter);
        Ok(())
    }

    async fn accept(&self) -> Result<Accepted> {
        self.queue.accept().await
    }

    async fn close(&self) -> Result<()> {
        if self.queue.shutdown.trigger() {
            self.net.close_plane(Plane::Client, &self.addr);
            self.net.clients.lock().remove(&self.addr);
            debug!("Loopback client {} closed", self.addr);
        }
        Ok(())
    }
}

/// Loopback stand-in for the NAT traversal session client
pub struct LoopbackSession {
    addr: String,
    net: Arc<Network>,
    queue: AcceptQueue,
}

impl LoopbackSession {
    fn new(addr: String, net: Arc<Network>) -> Self {
        Self {
            addr,
            net,
            queue: AcceptQueue::new(),
        }
    }
}

#[async_trait]
impl NatSessionClient for LoopbackSession {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn dial(&self, addr: &str, _config: &DialConfig) -> Result<BoxStream> {
        if self.queue.shutdown.is_triggered() {
            return Err(TunnelError::DialerClosed);
        }
        self.net.connect(Plane::Session, &self.addr, addr).await
    }

    async fn dial_udp(&self, addr: &str, _config: &DialConfig) -> Result<Arc<dyn DatagramSession>> {
        if self.queue.shutdown.is_triggered() {
            return Err(TunnelError::DialerClosed);
        }
        {
            let datagrams = self.net.datagrams.lock();
            let endpoint = datagrams
                .get(addr)
                .ok_or_else(|| TunnelError::Dial(format!("{}: unreachable", addr)))?;
            if !accepts(endpoint.filter.as_ref(), &self.addr) {
                return Err(TunnelError::Dial(format!("{}: rejected {}", addr, self.addr)));
            }
        }
        self.net.udp_dials.fetch_add(1, Ordering::Relaxed);

        let id = self.net.next_id.fetch_add(1, Ordering::Relaxed);
        let source = format!("{}#{}", self.addr, id);
        let rx = self.net.bind_datagram(&source, None);
        Ok(Arc::new(LoopbackDatagramSession {
            source,
            target: addr.to_string(),
            net: self.net.clone(),
            rx: AsyncMutex::new(rx),
            shutdown: Shutdown::new(),
        }))
    }

    async fn listen(&self, filter: Option<AcceptAddrs>) -> Result<()> {
        self.net
            .listen(Plane::Session, &self.addr, self.queue.tx.clone(), filter);
        Ok(())
    }

    async fn accept(&self) -> Result<Accepted> {
        self.queue.accept().await
    }

    async fn listen_udp(&self, filter: Option<AcceptAddrs>) -> Result<Arc<dyn DatagramConn>> {
        let rx = self.net.bind_datagram(&self.addr, filter);
        Ok(Arc::new(LoopbackDatagramListener {
            addr: self.addr.clone(),
            net: self.net.clone(),
            rx: AsyncMutex::new(rx),
            shutdown: Shutdown::new(),
            session: self.queue.shutdown.clone(),
        }))
    }

    fn public_addrs(&self) -> Vec<String> {
        vec![format!("loopback/{}", self.addr)]
    }

    async fn close(&self) -> Result<()> {
        if self.queue.shutdown.trigger() {
            self.net.close_plane(Plane::Session, &self.addr);
            self.net.unbind(&self.addr);
            debug!("Loopback session {} closed", self.addr);
        }
        Ok(())
    }
}

/// Datagram side of a listening loopback session
struct LoopbackDatagramListener {
    addr: String,
    net: Arc<Network>,
    rx: AsyncMutex<mpsc::Receiver<Datagram>>,
    shutdown: Shutdown,
    /// Closing the owning session closes this too
    session: Shutdown,
}

#[async_trait]
impl DatagramConn for LoopbackDatagramListener {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, PeerAddr)> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            next = rx.recv() => {
                let (payload, from) = next.ok_or(TunnelError::ListenerClosed)?;
                Ok((copy_into(buf, &payload), from))
            }
            _ = self.shutdown.wait() => Err(TunnelError::ListenerClosed),
            _ = self.session.wait() => Err(TunnelError::ListenerClosed),
        }
    }

    async fn send_to(&self, buf: &[u8], addr: &PeerAddr) -> Result<usize> {
        match addr {
            PeerAddr::Overlay(to) => self.net.deliver(to, buf, PeerAddr::Overlay(self.addr.clone())),
            PeerAddr::Socket(to) => Err(TunnelError::Dial(format!(
                "cannot send to socket address {} over the overlay",
                to
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.trigger() {
            self.net.unbind(&self.addr);
        }
        Ok(())
    }
}

/// Dialed loopback datagram session with its own reply address
struct LoopbackDatagramSession {
    source: String,
    target: String,
    net: Arc<Network>,
    rx: AsyncMutex<mpsc::Receiver<Datagram>>,
    shutdown: Shutdown,
}

#[async_trait]
impl DatagramSession for LoopbackDatagramSession {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.shutdown.is_triggered() {
            return Err(TunnelError::DialerClosed);
        }
        self.net
            .deliver(&self.target, buf, PeerAddr::Overlay(self.source.clone()))
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            next = rx.recv() => {
                let (payload, _from) = next.ok_or(TunnelError::DialerClosed)?;
                Ok(copy_into(buf, &payload))
            }
            _ = self.shutdown.wait() => Err(TunnelError::DialerClosed),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.trigger() {
            self.net.unbind(&self.source);
        }
        Ok(())
    }
}

/// Datagram semantics: anything beyond `buf` is truncated.
fn copy_into(buf: &mut [u8], payload: &[u8]) -> usize {
    let n = payload.len().min(buf.len());
    buf[..n].copy_from_slice(&payload[..n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::capability::{Dialer, Listener};
    use crate::overlay::{OverlayDialer, OverlayListener, SessionDialer, SessionListener};

    async fn client(overlay: &LoopbackOverlay, id: &str) -> Arc<dyn OverlayClient> {
        overlay
            .connect_client(&Account::generate(), id, &TunnelConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_overlay_stream_roundtrip() {
        let overlay = LoopbackOverlay::new();
        let alice = client(&overlay, "alice").await;
        let bob = client(&overlay, "bob").await;

        let listener = OverlayListener::listen(bob.clone(), None).await.unwrap();
        let dialer = OverlayDialer::new(alice.clone());

        let mut out = dialer.dial(&bob.addr(), &DialConfig::default()).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.peer, alice.addr());

        out.write_all(b"hi bob").await.unwrap();
        let mut buf = [0u8; 6];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi bob");
    }

    #[tokio::test]
    async fn test_accept_filter_rejects_and_reinstalls() {
        let overlay = LoopbackOverlay::new();
        let alice = client(&overlay, "alice").await;
        let bob = client(&overlay, "bob").await;

        let only_carol = AcceptAddrs::new(["^carol\\."]).unwrap();
        let listener = OverlayListener::listen(bob.clone(), Some(only_carol))
            .await
            .unwrap();
        let dialer = OverlayDialer::new(alice.clone());

        let res = dialer.dial(&bob.addr(), &DialConfig::default()).await;
        assert!(matches!(res, Err(TunnelError::Dial(_))));

        listener
            .install(Some(AcceptAddrs::new(["^alice\\."]).unwrap()))
            .await
            .unwrap();
        assert!(dialer.dial(&bob.addr(), &DialConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let overlay = LoopbackOverlay::new();
        let account = Account::generate();
        let config = TunnelConfig::default();
        let first = overlay.connect_client(&account, "x", &config).await.unwrap();
        let second = overlay.connect_client(&account, "x", &config).await;
        assert!(matches!(second, Err(TunnelError::Client(_))));

        first.close().await.unwrap();
        assert!(overlay.connect_client(&account, "x", &config).await.is_ok());
    }

    #[tokio::test]
    async fn test_overlay_dialer_has_no_udp() {
        let overlay = LoopbackOverlay::new();
        let dialer = OverlayDialer::new(client(&overlay, "alice").await);
        let res = dialer.dial_udp("bob.00", &DialConfig::default()).await;
        assert!(matches!(res, Err(TunnelError::UdpUnsupported)));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept_and_is_idempotent() {
        let overlay = LoopbackOverlay::new();
        let bob = client(&overlay, "bob").await;
        let listener = Arc::new(OverlayListener::listen(bob, None).await.unwrap());

        let pending = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close().await.unwrap();
        listener.close().await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(TunnelError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_session_datagram_roundtrip() {
        let overlay = LoopbackOverlay::new();
        let config = TunnelConfig::default();
        let alice = client(&overlay, "alice").await;
        let bob = client(&overlay, "bob").await;
        let alice_session = overlay
            .connect_session(&Account::generate(), alice, &config)
            .await
            .unwrap();
        let bob_session = overlay
            .connect_session(&Account::generate(), bob.clone(), &config)
            .await
            .unwrap();

        let listener = SessionListener::listen(bob_session, None).await.unwrap();
        let inbound = listener.listen_udp().await.unwrap();

        let dialer = SessionDialer::new(alice_session);
        let outbound = dialer
            .dial_udp(&bob.addr(), &DialConfig::default())
            .await
            .unwrap();
        assert_eq!(overlay.udp_dials(), 1);

        outbound.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = inbound.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        inbound.send_to(b"pong", &from).await.unwrap();
        let n = outbound.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_session_public_addrs() {
        let overlay = LoopbackOverlay::new();
        let alice = client(&overlay, "alice").await;
        let session = overlay
            .connect_session(&Account::generate(), alice.clone(), &TunnelConfig::default())
            .await
            .unwrap();
        assert_eq!(session.public_addrs(), vec![format!("loopback/{}", alice.addr())]);
    }

    #[test]
    fn test_copy_into_truncates() {
        let mut buf = [0u8; 2];
        assert_eq!(copy_into(&mut buf, b"abc"), 2);
        assert_eq!(&buf, b"ab");
    }
}
