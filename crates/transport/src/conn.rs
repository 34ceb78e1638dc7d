//! Stream and datagram handle contracts
//!
//! Every transport hands the relay the same two shapes: a byte stream
//! (`BoxStream`) and a datagram handle, either unconnected (`DatagramConn`,
//! the listening side) or connected to one destination (`DatagramSession`,
//! the dialed side).

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use meshtunnel_core::Result;

/// Largest datagram the relay reads or writes in one piece
pub const MAX_UDP_PACKET: usize = 65_535;

/// A full-duplex byte stream
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> StreamConn for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned stream of any transport
pub type BoxStream = Box<dyn StreamConn>;

/// An accepted stream together with the peer it came from
pub struct Accepted {
    pub stream: BoxStream,
    pub peer: String,
}

impl Accepted {
    pub fn new(stream: impl StreamConn + 'static, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted").field("peer", &self.peer).finish()
    }
}

/// Source or destination of a datagram
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    /// Plain UDP socket address
    Socket(SocketAddr),
    /// Overlay session source
    Overlay(String),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Socket(addr) => write!(f, "{}", addr),
            PeerAddr::Overlay(addr) => f.write_str(addr),
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::Socket(addr)
    }
}

/// Unconnected datagram handle: receives from many sources, replies to any.
///
/// `close` must unblock a pending `recv_from`.
#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, PeerAddr)>;

    async fn send_to(&self, buf: &[u8], addr: &PeerAddr) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

/// Datagram handle bound to a single destination.
///
/// `close` must unblock a pending `recv`.
#[async_trait]
pub trait DatagramSession: Send + Sync {
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addr_display() {
        let socket = PeerAddr::from("127.0.0.1:8000".parse::<SocketAddr>().unwrap());
        assert_eq!(socket.to_string(), "127.0.0.1:8000");

        let overlay = PeerAddr::Overlay("alice.abcd".to_string());
        assert_eq!(overlay.to_string(), "alice.abcd");
    }

    #[tokio::test]
    async fn test_accepted_boxes_any_stream() {
        let (a, _b) = tokio::io::duplex(64);
        let accepted = Accepted::new(a, "peer");
        assert_eq!(accepted.peer, "peer");
        assert!(format!("{:?}", accepted).contains("peer"));
    }
}
