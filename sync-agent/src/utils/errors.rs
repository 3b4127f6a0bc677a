//! Custom error types for the sync agent.

use sync_protocol::model::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] sync_protocol::ProtocolError),

    #[error("apply error: {1}")]
    Apply(ErrorCode, String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl AgentError {
    /// Best-effort mapping onto the wire-facing taxonomy (§7), used when
    /// classifying a failure for `task_report.error_code`.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AgentError::Protocol(_) => ErrorCode::Proto,
            AgentError::Io(e) => io_error_code(e),
            AgentError::Apply(code, _) => *code,
            AgentError::Config(_) | AgentError::Tls(_) => ErrorCode::Unknown,
        }
    }
}

/// Classifies a raw I/O error into the filesystem codes the apply
/// pipeline reports, with a fallback for anything not explicitly named
/// in §7.
pub fn io_error_code(e: &std::io::Error) -> ErrorCode {
    use std::io::ErrorKind::*;
    match e.kind() {
        PermissionDenied => ErrorCode::Eacces,
        NotFound => ErrorCode::Enoent,
        _ => match e.raw_os_error() {
            Some(libc_enospc) if libc_enospc == 28 => ErrorCode::Enospc,
            Some(libc_erofs) if libc_erofs == 30 => ErrorCode::Erofs,
            Some(libc_eperm) if libc_eperm == 1 => ErrorCode::Eperm,
            _ => ErrorCode::Unknown,
        },
    }
}

/// Human-readable remediation hint appended to `lastError` for filesystem
/// codes, per §7 "Human-readable remediation hints are added for
/// filesystem codes."
pub fn remediation_hint(code: ErrorCode) -> Option<&'static str> {
    match code {
        ErrorCode::Eacces | ErrorCode::Eperm => {
            Some("check that the agent process has write access to the target path")
        }
        ErrorCode::Erofs => Some("target filesystem is mounted read-only"),
        ErrorCode::Enospc => Some("free up disk space on the target filesystem and retry"),
        ErrorCode::Enoent => Some("a parent directory of the target path is missing"),
        _ => None,
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permission_denied() {
        let e = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(io_error_code(&e), ErrorCode::Eacces);
    }

    #[test]
    fn classifies_not_found() {
        let e = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(io_error_code(&e), ErrorCode::Enoent);
    }

    #[test]
    fn remediation_hint_present_for_fs_codes_only() {
        assert!(remediation_hint(ErrorCode::Enospc).is_some());
        assert!(remediation_hint(ErrorCode::Proto).is_none());
    }

    #[test]
    fn apply_error_carries_its_own_code_through() {
        let e = AgentError::Apply(ErrorCode::MissingBlock, "server could not supply block 0".into());
        assert_eq!(e.error_code(), ErrorCode::MissingBlock);
    }
}
