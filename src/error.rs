use thiserror::Error;

use crate::transport::TransportError;

/// Crate-wide error taxonomy. Every kind maps to one wire surface; the
/// HTTP translation lives in the API layer.
#[derive(Error, Debug)]
pub enum GridqError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("credential does not belong to principal '{0}'")]
    PrincipalMismatch(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation invalid for job in terminal state '{0}'")]
    TerminalState(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("{active} active job(s) already in progress, maximum {max} per principal")]
    ConcurrencyLimited { active: i64, max: usize },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("storage: {0}")]
    Storage(String),

    #[error("artifact rejected by scanner: {0}")]
    ScannerReject(String),
}

impl GridqError {
    /// Stable machine-readable kind string carried in error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            GridqError::Unauthenticated(_) => "unauthenticated",
            GridqError::PrincipalMismatch(_) => "principal-mismatch",
            GridqError::Forbidden(_) => "forbidden",
            GridqError::NotFound(_) => "not-found",
            GridqError::TerminalState(_) => "terminal-state",
            GridqError::Validation(_) => "validation",
            GridqError::RateLimited { .. } => "quota-rate",
            GridqError::ConcurrencyLimited { .. } => "quota-concurrent",
            GridqError::Transport(_) => "transport",
            GridqError::Storage(_) => "storage",
            GridqError::ScannerReject(_) => "scanner-reject",
        }
    }
}

impl From<rusqlite::Error> for GridqError {
    fn from(err: rusqlite::Error) -> Self {
        GridqError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GridqError>;
