use lab_provider::ProviderError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lab {0} is already deploying")]
    AlreadyDeploying(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("{stage} failed: {source}")]
    StageFailed {
        stage: &'static str,
        source: ProviderError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
