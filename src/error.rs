//! Crate-wide error type for the mirror selection and indexing core.

use thiserror::Error;

/// Errors surfaced by the core components (§7 of the design spec).
#[derive(Debug, Error)]
pub enum MirrorbitsError {
    #[error("path not found in source repository")]
    NotFound,

    #[error("no eligible mirror carries this file")]
    NoEligibleMirror,

    #[error("a scan is already in progress for this identifier")]
    ScanInProgress,

    #[error("scan aborted")]
    ScanAborted,

    #[error("mirror has neither an rsync nor an ftp sync url")]
    NoSyncMethod,

    #[error("name already taken: {0}")]
    NameAlreadyTaken(String),

    #[error("path escapes the repository root")]
    OutsideRepository,

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("shared store unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("geo database error: {0}")]
    Geo(String),

    #[error("rsync reported a protocol error")]
    RsyncProtocol,

    #[error("rsync scan timed out")]
    RsyncTimeout,

    #[error("{0}")]
    Internal(String),
}

impl MirrorbitsError {
    /// Maps an error kind to the HTTP status code the request pipeline (C10)
    /// should answer with, per §7.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            MirrorbitsError::NotFound => StatusCode::NOT_FOUND,
            MirrorbitsError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            MirrorbitsError::OutsideRepository => StatusCode::BAD_REQUEST,
            MirrorbitsError::NameAlreadyTaken(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, MirrorbitsError>;
