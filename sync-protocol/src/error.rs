//! Protocol-level error types shared by both sides of the wire.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {1} byte maximum")]
    FrameTooLarge(u32, u32),

    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed before a complete frame was read")]
    ConnectionClosed,

    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("deadline exceeded waiting for {0}")]
    DeadlineExceeded(&'static str),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
