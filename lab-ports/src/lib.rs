//! Network port management library.
//!
//! Terminal-access ports are handed out from one process-wide pool so that two labs deployed
//! at the same time never receive the same port.

pub mod pool;
pub mod range;

pub use pool::PortPool;
pub use range::PortRange;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortError {
    #[error("Invalid port range format: {0} (expected START-END, e.g. 22000-22999)")]
    InvalidFormat(String),

    #[error("Invalid range: start ({start}) must be less than end ({end})")]
    InvalidRange { start: u16, end: u16 },

    #[error("Port {port} is outside the managed range {range}")]
    OutOfRange { port: u16, range: String },

    #[error("Port {port} is already leased to {owner}")]
    AlreadyLeased { port: u16, owner: String },

    #[error("No free port left in range {0}")]
    Exhausted(String),
}

pub type Result<T> = std::result::Result<T, PortError>;
