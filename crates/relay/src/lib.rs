//! MeshTunnel Relay
//!
//! The tunnel engine. Each [`Tunnel`] owns its listeners and shares one
//! dialer with the tunnels built alongside it. Every accepted stream is
//! paired with a fresh dial to the destination and relayed by [`pipe`];
//! datagrams go through the [`UdpRelay`] pseudo-connection table.

/// Log at info when verbose, debug otherwise
macro_rules! verbose {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

mod pipe;
mod table;
mod tunnel;
mod udp;

pub use pipe::pipe;
pub use table::PseudoConnTable;
pub use tunnel::Tunnel;
pub use udp::UdpRelay;
