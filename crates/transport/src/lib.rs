//! MeshTunnel Transport
//!
//! Dial/listen capability contracts and the adapters that satisfy them.
//!
//! ## Adapters
//!
//! - **Overlay**: the bare multi-path overlay client (streams only)
//! - **Session**: the NAT traversal session client (streams and datagrams)
//! - **Socket**: plain TCP listeners/dialers and UDP sockets
//!
//! The overlay and session clients themselves are external collaborators,
//! described by the contracts in [`provider`]. [`LoopbackOverlay`] is an
//! in-process implementation of those contracts.

mod capability;
mod conn;
mod loopback;
mod overlay;
pub mod provider;
mod shutdown;
mod socket;

pub use capability::{Dialer, Listener};
pub use conn::{
    Accepted, BoxStream, DatagramConn, DatagramSession, PeerAddr, StreamConn, MAX_UDP_PACKET,
};
pub use loopback::{LoopbackClient, LoopbackOverlay, LoopbackSession};
pub use overlay::{CloseOnce, OverlayDialer, OverlayListener, SessionDialer, SessionListener};
pub use provider::{NatSessionClient, OverlayClient, OverlayProvider};
pub use shutdown::Shutdown;
pub use socket::{ConnectedUdp, SocketDatagram, SocketDialer, SocketListener};
