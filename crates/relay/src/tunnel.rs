//! Tunnel lifecycle: construction, accept loops, close

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use meshtunnel_core::{
    classify_from, classify_to, AcceptAddrs, Account, Result, Side, TunnelConfig, TunnelError,
};
use meshtunnel_transport::{
    Accepted, BoxStream, CloseOnce, Dialer, Listener, NatSessionClient, OverlayClient, OverlayDialer,
    OverlayListener, OverlayProvider, SessionDialer, SessionListener, Shutdown, SocketDialer,
    SocketListener,
};

use crate::pipe::pipe;
use crate::udp::UdpRelay;

/// Relay between one from-address and one to-address.
///
/// Cloning gives another handle to the same tunnel. Tunnels built together
/// by [`Tunnel::new_tunnels`] share one dialer, so closing any of them closes
/// that dialer for all.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

struct Inner {
    from: String,
    to: String,
    from_side: Side,
    to_side: Side,
    config: TunnelConfig,
    /// Shared overlay (or socket) dialer; closed with the tunnel
    dialer: Arc<dyn Dialer>,
    /// What connections to `to` go through
    outbound: Arc<dyn Dialer>,
    listeners: Vec<Arc<dyn Listener>>,
    closed: RwLock<bool>,
    shutdown: Shutdown,
    udp: Mutex<Option<Arc<UdpRelay>>>,
    client: Option<Arc<dyn OverlayClient>>,
    session: Option<Arc<dyn NatSessionClient>>,
}

/// Overlay side shared by every tunnel of one construction
struct OverlayTransports {
    client: Arc<dyn OverlayClient>,
    session: Option<Arc<dyn NatSessionClient>>,
    dialer: Arc<dyn Dialer>,
}

impl Tunnel {
    /// Build a single tunnel from `from` to `to`.
    ///
    /// `provider` is only consulted when one side is an overlay address.
    pub async fn new(
        provider: Option<&dyn OverlayProvider>,
        account: &Account,
        identifier: &str,
        from: &str,
        to: &str,
        nat: bool,
        config: Option<TunnelConfig>,
    ) -> Result<Self> {
        let mut tunnels = Self::new_tunnels(
            provider,
            account,
            identifier,
            &[from.to_string()],
            &[to.to_string()],
            nat,
            config,
        )
        .await?;
        tunnels
            .pop()
            .ok_or_else(|| TunnelError::InvalidAddressList("no tunnel built".to_string()))
    }

    /// Build one tunnel per `(from[i], to[i])` pair, all sharing one dialer.
    ///
    /// Nothing stays open when construction fails.
    pub async fn new_tunnels(
        provider: Option<&dyn OverlayProvider>,
        account: &Account,
        identifier: &str,
        from: &[String],
        to: &[String],
        nat: bool,
        config: Option<TunnelConfig>,
    ) -> Result<Vec<Self>> {
        let config = TunnelConfig::merged(config);

        if config.udp && !nat {
            return Err(TunnelError::UdpUnsupported);
        }
        if from.is_empty() || from.len() != to.len() {
            return Err(TunnelError::InvalidAddressList(format!(
                "{} from addresses for {} to addresses",
                from.len(),
                to.len()
            )));
        }

        let sides: Vec<(Side, Side)> = from
            .iter()
            .zip(to)
            .map(|(f, t)| (classify_from(f), classify_to(t)))
            .collect();
        if sides.len() > 1 && sides.iter().any(|(f, _)| f.is_overlay()) {
            return Err(TunnelError::MultipleOverlayListeners);
        }

        let filter = config
            .accept_addrs
            .as_ref()
            .map(AcceptAddrs::new)
            .transpose()?;

        let needs_overlay = sides.iter().any(|(f, t)| f.is_overlay() || t.is_overlay());
        let overlay = if needs_overlay {
            Some(connect_overlay(provider, account, identifier, nat, &config).await?)
        } else {
            None
        };

        let socket_dialer: Arc<dyn Dialer> = Arc::new(SocketDialer::new());
        let dialer = overlay
            .as_ref()
            .map_or_else(|| socket_dialer.clone(), |o| o.dialer.clone());

        let mut tunnels: Vec<Tunnel> = Vec::with_capacity(sides.len());
        for ((from, to), (from_side, to_side)) in from.iter().zip(to).zip(sides) {
            let built = build_listeners(from, from_side, overlay.as_ref(), filter.clone()).await;
            let (from_addr, listeners) = match built {
                Ok(built) => built,
                Err(e) => {
                    error!("Listening at {} failed: {}", from, e);
                    for tunnel in &tunnels {
                        let _ = tunnel.close_listeners().await;
                    }
                    let _ = dialer.close().await;
                    return Err(e);
                }
            };

            info!("Listening at {}", from_addr);

            let outbound = if to_side.is_overlay() {
                dialer.clone()
            } else {
                socket_dialer.clone()
            };

            tunnels.push(Tunnel {
                inner: Arc::new(Inner {
                    from: from_addr,
                    to: to.clone(),
                    from_side,
                    to_side,
                    config: config.clone(),
                    dialer: dialer.clone(),
                    outbound,
                    listeners,
                    closed: RwLock::new(false),
                    shutdown: Shutdown::new(),
                    udp: Mutex::new(None),
                    client: overlay.as_ref().map(|o| o.client.clone()),
                    session: overlay.as_ref().and_then(|o| o.session.clone()),
                }),
            });
        }

        Ok(tunnels)
    }

    /// Serve until a listener fails or the tunnel is closed.
    ///
    /// A deliberate [`Tunnel::close`] makes this return `Ok`; any listener
    /// (or UDP receive) failure closes the whole tunnel and is returned.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let (err_tx, mut err_rx) = mpsc::channel::<TunnelError>(inner.listeners.len() + 1);

        for listener in &inner.listeners {
            tokio::spawn(self.clone().accept_loop(listener.clone(), err_tx.clone()));
        }

        if inner.config.udp {
            if let Err(e) = self.start_udp(err_tx.clone()).await {
                error!("UDP relay at {} failed to start: {}", inner.from, e);
                let _ = self.close().await;
                return Err(e);
            }
        }
        drop(err_tx);

        let err = err_rx.recv().await.unwrap_or(TunnelError::ListenerClosed);

        if self.is_closed().await {
            return Ok(());
        }

        error!("Tunnel {} -> {} stopped: {}", inner.from, inner.to, err);
        if let Err(close_err) = self.close().await {
            warn!("Closing tunnel: {}", close_err);
        }
        Err(err)
    }

    async fn accept_loop(self, listener: Arc<dyn Listener>, err_tx: mpsc::Sender<TunnelError>) {
        loop {
            match listener.accept().await {
                Ok(accepted) => {
                    verbose!(self.inner.config.verbose, "Accept from {}", accepted.peer);
                    tokio::spawn(self.clone().relay(accepted));
                }
                Err(e) => {
                    if !e.is_closed() {
                        warn!("Accept at {} failed: {}", listener.addr(), e);
                    }
                    let _ = err_tx.send(e).await;
                    return;
                }
            }
        }
    }

    /// Pair one accepted connection with a fresh dial to `to`
    async fn relay(self, accepted: Accepted) {
        let Accepted { stream, peer } = accepted;
        match self.dial_to().await {
            Ok(dialed) => {
                verbose!(self.inner.config.verbose, "Dial to {} for {}", self.inner.to, peer);
                pipe(stream, dialed).await;
                verbose!(self.inner.config.verbose, "Closed {} <-> {}", peer, self.inner.to);
            }
            Err(e) => {
                // Dropping the accepted stream closes it.
                warn!("Dial to {} for {} failed: {}", self.inner.to, peer, e);
            }
        }
    }

    async fn dial_to(&self) -> Result<BoxStream> {
        let inner = &self.inner;
        let dial = inner.outbound.dial(&inner.to, &inner.config.dial);
        match inner.config.dial.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, dial)
                .await
                .map_err(|_| TunnelError::DialTimeout(inner.config.dial.dial_timeout_ms))?,
            None => dial.await,
        }
    }

    async fn start_udp(&self, err_tx: mpsc::Sender<TunnelError>) -> Result<()> {
        let inner = &self.inner;
        let listener = inner
            .listeners
            .first()
            .ok_or_else(|| TunnelError::InvalidAddressList("tunnel has no listener".to_string()))?;
        let from_conn = listener.listen_udp().await?;

        let relay = Arc::new(UdpRelay::new(
            inner.to.clone(),
            inner.outbound.clone(),
            inner.config.dial.clone(),
            inner.config.udp_idle_time(),
            inner.shutdown.clone(),
            inner.config.verbose,
        ));
        *inner.udp.lock() = Some(relay.clone());

        info!("UDP relay {} -> {}", inner.from, inner.to);
        relay.spawn_janitor();
        tokio::spawn(async move {
            if let Err(e) = relay.run(from_conn).await {
                let _ = err_tx.send(e).await;
            }
        });
        Ok(())
    }

    /// Close the dialer, every listener and all UDP sessions.
    ///
    /// Idempotent. Errors from each resource are collected into one.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let mut closed = inner.closed.write().await;
        if *closed {
            return Ok(());
        }
        *closed = true;
        inner.shutdown.trigger();

        let mut errors = Vec::new();
        if let Err(e) = inner.dialer.close().await {
            errors.push(e);
        }
        if let Err(e) = self.close_listeners().await {
            errors.push(e);
        }
        let udp = inner.udp.lock().take();
        if let Some(relay) = udp {
            if let Err(e) = relay.close_all().await {
                errors.push(e);
            }
        }

        info!("Tunnel {} -> {} closed", inner.from, inner.to);
        match TunnelError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close_listeners(&self) -> Result<()> {
        let results = join_all(self.inner.listeners.iter().map(|l| l.close())).await;
        let errors: Vec<TunnelError> = results.into_iter().filter_map(|r| r.err()).collect();
        match TunnelError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        *self.inner.closed.read().await
    }

    /// Reinstall the accept-address allow-list on every listener
    pub async fn set_accept_addrs(&self, filter: Option<AcceptAddrs>) -> Result<()> {
        match &filter {
            Some(filter) => info!("Accept addresses for {}: {:?}", self.inner.from, filter.patterns()),
            None => info!("Accepting any address at {}", self.inner.from),
        }
        let results = join_all(
            self.inner
                .listeners
                .iter()
                .map(|l| l.install(filter.clone())),
        )
        .await;
        let errors: Vec<TunnelError> = results.into_iter().filter_map(|r| r.err()).collect();
        match TunnelError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Address accepted connections arrive on (the overlay identity when the
    /// from-side is overlay, the bound socket address otherwise)
    pub fn from_addr(&self) -> &str {
        &self.inner.from
    }

    pub fn to_addr(&self) -> &str {
        &self.inner.to
    }

    pub fn from_side(&self) -> Side {
        self.inner.from_side
    }

    pub fn to_side(&self) -> Side {
        self.inner.to_side
    }

    /// Overlay identity, if an overlay client was built
    pub fn addr(&self) -> Option<String> {
        self.inner.client.as_ref().map(|c| c.addr())
    }

    /// Public addresses discovered by the NAT traversal session
    pub fn public_addrs(&self) -> Vec<String> {
        self.inner
            .session
            .as_ref()
            .map(|s| s.public_addrs())
            .unwrap_or_default()
    }

    pub fn overlay_client(&self) -> Option<Arc<dyn OverlayClient>> {
        self.inner.client.clone()
    }

    pub fn session_client(&self) -> Option<Arc<dyn NatSessionClient>> {
        self.inner.session.clone()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Live UDP pseudo-connections
    pub fn udp_session_count(&self) -> usize {
        let relay = self.inner.udp.lock().clone();
        match relay {
            Some(relay) => relay.session_count(),
            None => 0,
        }
    }

    /// Whether both tunnels go through the same dialer
    pub fn shares_dialer_with(&self, other: &Tunnel) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inner.dialer) as *const (),
            Arc::as_ptr(&other.inner.dialer) as *const (),
        )
    }
}

async fn connect_overlay(
    provider: Option<&dyn OverlayProvider>,
    account: &Account,
    identifier: &str,
    nat: bool,
    config: &TunnelConfig,
) -> Result<OverlayTransports> {
    let provider = provider
        .ok_or_else(|| TunnelError::Client("no overlay provider configured".to_string()))?;

    info!("Seed: {}", account.seed_hex());

    // Dialer and listeners share these handles; each closes underneath once.
    let client: Arc<dyn OverlayClient> = Arc::new(CloseOnce::new(
        provider.connect_client(account, identifier, config).await?,
    ));
    if let Err(e) = client.wait_connected().await {
        let _ = client.close().await;
        return Err(e);
    }
    info!("Overlay client {} connected", client.addr());

    if !nat {
        let dialer: Arc<dyn Dialer> = Arc::new(OverlayDialer::new(client.clone()));
        return Ok(OverlayTransports {
            client,
            session: None,
            dialer,
        });
    }

    let session: Arc<dyn NatSessionClient> =
        match provider.connect_session(account, client.clone(), config).await {
            Ok(session) => Arc::new(CloseOnce::new(session)),
            Err(e) => {
                let _ = client.close().await;
                return Err(e);
            }
        };
    let dialer: Arc<dyn Dialer> =
        Arc::new(SessionDialer::new(session.clone()).with_client(client.clone()));
    Ok(OverlayTransports {
        client,
        session: Some(session),
        dialer,
    })
}

/// Listeners for one from-address, with the address peers reach them on
async fn build_listeners(
    from: &str,
    side: Side,
    overlay: Option<&OverlayTransports>,
    filter: Option<AcceptAddrs>,
) -> Result<(String, Vec<Arc<dyn Listener>>)> {
    if !side.is_overlay() {
        let listener = SocketListener::bind(from).await?;
        let addr = listener.addr();
        return Ok((addr, vec![Arc::new(listener)]));
    }

    let overlay = overlay
        .ok_or_else(|| TunnelError::Client("overlay client not connected".to_string()))?;
    let mut listeners: Vec<Arc<dyn Listener>> = Vec::with_capacity(2);
    if let Some(session) = &overlay.session {
        listeners.push(Arc::new(
            SessionListener::listen(session.clone(), filter.clone()).await?,
        ));
    }
    listeners.push(Arc::new(
        OverlayListener::listen(overlay.client.clone(), filter).await?,
    ));
    Ok((overlay.client.addr(), listeners))
}
