//! Primary-side error type. There is no HTTP surface here (unlike the
//! teacher's `axum`-bound `AppError`), so this is a plain `thiserror` enum
//! logged at the call site rather than converted into a response.

use sync_protocol::model::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("fingerprint mismatch")]
    FingerprintMismatch,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] sync_protocol::ProtocolError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Best-effort mapping onto the wire-facing taxonomy, used when an
    /// internal failure must be reported to a caller that only understands
    /// `ErrorCode`.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::Protocol(_) => ErrorCode::Proto,
            AppError::InvalidToken | AppError::FingerprintMismatch => ErrorCode::Proto,
            _ => ErrorCode::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
