//! MeshTunnel Core Types
//!
//! Errors, configuration, address classification and account identity shared
//! by the transport adapters and the relay engine.

mod account;
mod address;
mod config;
mod error;

pub use account::*;
pub use address::*;
pub use config::*;
pub use error::*;
