//! Error types for Shipyard.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("logs unavailable: {0}")]
    LogsUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
