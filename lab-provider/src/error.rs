//! Error types for provisioning and configuration adapters.

use lab_core::CoreError;
use lab_ports::PortError;
use thiserror::Error;

/// Errors raised by the external-tool adapters.
///
/// The orchestrator treats any of these coming out of a `Provisioner` as a provisioning
/// failure and out of a `Configurator` as a configuration failure.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Command failed (exit code {exit_code:?}): {command}\n{output}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Could not run command: {0}")]
    Execution(String),

    #[error("Malformed tool output: {0}")]
    MalformedOutput(String),

    #[error("VMs not reachable after {waited_secs}s: {pending}")]
    ReadinessTimeout { waited_secs: u64, pending: String },

    #[error("Invalid playbook: {0}")]
    InvalidPlaybook(String),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Port allocation failed: {0}")]
    Ports(#[from] PortError),

    #[error("Deployment log unavailable: {0}")]
    LogSink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl From<CoreError> for ProviderError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(msg) => ProviderError::Timeout(msg),
            CoreError::Io(e) => ProviderError::Io(e),
            other => ProviderError::Execution(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ProviderError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProviderError::Join(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
