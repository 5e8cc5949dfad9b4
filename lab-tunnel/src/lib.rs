//! Remote access tunnel.
//!
//! Relays bytes between a client-facing, message-oriented transport (a WebSocket, or a raw
//! stream adapted through [`framed_client`]) and a VM's terminal or graphical TCP endpoint.
//! Every live relay is tracked in a [`SessionRegistry`] so callers can list and force-close
//! the sessions of a VM.

pub mod error;
pub mod registry;
pub mod session;
pub mod stream;

pub use error::{Result, TunnelError};
pub use registry::{Protocol, SessionInfo, SessionRegistry};
pub use session::{SessionEnd, SessionHandle, TunnelConfig, TunnelService};
pub use stream::framed_client;
