//! Plain TCP/UDP socket adapters

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tracing::debug;

use meshtunnel_core::{AcceptAddrs, DialConfig, Result, TunnelError};

use crate::capability::{Dialer, Listener};
use crate::conn::{Accepted, BoxStream, DatagramConn, DatagramSession, PeerAddr};
use crate::shutdown::Shutdown;

/// Dials plain TCP streams and connected UDP sockets.
///
/// Holds no long-lived resources, so closing it is a no-op.
#[derive(Debug, Default)]
pub struct SocketDialer;

impl SocketDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for SocketDialer {
    fn addr(&self) -> Option<String> {
        None
    }

    async fn dial(&self, addr: &str, _config: &DialConfig) -> Result<BoxStream> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::Dial(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(&self, addr: &str, _config: &DialConfig) -> Result<Arc<dyn DatagramSession>> {
        let remote = resolve(addr).await?;
        let bind = if remote.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket
            .connect(remote)
            .await
            .map_err(|e| TunnelError::Dial(format!("{}: {}", addr, e)))?;
        Ok(Arc::new(ConnectedUdp {
            socket,
            shutdown: Shutdown::new(),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await
        .map_err(|e| TunnelError::Dial(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| TunnelError::Dial(format!("{}: no address resolved", addr)))
}

/// UDP socket connected to one destination
pub struct ConnectedUdp {
    socket: UdpSocket,
    shutdown: Shutdown,
}

#[async_trait]
impl DatagramSession for ConnectedUdp {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.shutdown.is_triggered() {
            return Err(TunnelError::DialerClosed);
        }
        Ok(self.socket.send(buf).await?)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        tokio::select! {
            res = self.socket.recv(buf) => Ok(res?),
            _ = self.shutdown.wait() => Err(TunnelError::DialerClosed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.trigger();
        Ok(())
    }
}

/// TCP listener, with a UDP socket on the same address on demand
pub struct SocketListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: Shutdown,
}

impl SocketListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            shutdown: Shutdown::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for SocketListener {
    fn addr(&self) -> String {
        self.local_addr.to_string()
    }

    async fn accept(&self) -> Result<Accepted> {
        if self.shutdown.is_triggered() {
            return Err(TunnelError::ListenerClosed);
        }
        tokio::select! {
            res = self.listener.accept() => {
                let (stream, peer) = res?;
                stream.set_nodelay(true)?;
                Ok(Accepted::new(stream, peer.to_string()))
            }
            _ = self.shutdown.wait() => Err(TunnelError::ListenerClosed),
        }
    }

    async fn install(&self, _filter: Option<AcceptAddrs>) -> Result<()> {
        debug!("Accept addresses do not apply to socket listener {}", self.local_addr);
        Ok(())
    }

    async fn listen_udp(&self) -> Result<Arc<dyn DatagramConn>> {
        let socket = UdpSocket::bind(self.local_addr).await?;
        Ok(Arc::new(SocketDatagram {
            socket,
            shutdown: self.shutdown.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.trigger();
        Ok(())
    }
}

/// Unconnected UDP socket; closes together with its listener
pub struct SocketDatagram {
    socket: UdpSocket,
    shutdown: Shutdown,
}

impl SocketDatagram {
    pub async fn bind(addr: &str) -> Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr).await?,
            shutdown: Shutdown::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DatagramConn for SocketDatagram {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, PeerAddr)> {
        tokio::select! {
            res = self.socket.recv_from(buf) => {
                let (n, from) = res?;
                Ok((n, PeerAddr::Socket(from)))
            }
            _ = self.shutdown.wait() => Err(TunnelError::ListenerClosed),
        }
    }

    async fn send_to(&self, buf: &[u8], addr: &PeerAddr) -> Result<usize> {
        match addr {
            PeerAddr::Socket(to) => Ok(self.socket.send_to(buf, to).await?),
            PeerAddr::Overlay(to) => Err(TunnelError::Dial(format!(
                "cannot send to overlay address {} over a UDP socket",
                to
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.trigger();
        Ok(())
    }
}
