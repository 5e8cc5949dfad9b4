use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// The backend endpoint refused, was unreachable, or did not answer in time.
    /// No session was registered.
    #[error("Could not connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TunnelError>;
