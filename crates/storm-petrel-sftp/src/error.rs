//! Error types for the connection and session engine
//!
//! Per-connection errors never tear down the process; the accept loop
//! survives every variant here. Errors flowing back to SFTP clients are
//! mapped to protocol status codes and sanitized so path or backend details
//! are not leaked.

use storm_petrel_core::AuthError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("no such file: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid file handle: {0}")]
    InvalidHandle(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("handshake not completed within the deadline")]
    HandshakeTimeout,

    #[error("too many authentication attempts")]
    TooManyAuthAttempts,
}

impl Error {
    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound(path.into())
    }

    pub fn permission_denied(detail: impl Into<String>) -> Self {
        Error::PermissionDenied(detail.into())
    }

    pub fn invalid_path(detail: impl Into<String>) -> Self {
        Error::InvalidPath(detail.into())
    }

    pub fn unsupported(detail: impl Into<String>) -> Self {
        Error::Unsupported(detail.into())
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Error::Protocol(detail.into())
    }

    /// SFTP status code reported to the client for this error.
    pub fn status_code(&self) -> crate::protocol::StatusCode {
        use crate::protocol::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NoSuchFile,
            Error::PermissionDenied(_) | Error::Auth(_) => StatusCode::PermissionDenied,
            Error::InvalidPath(_) | Error::InvalidHandle(_) | Error::Protocol(_) => {
                StatusCode::BadMessage
            }
            Error::Unsupported(_) => StatusCode::OpUnsupported,
            Error::Connection(_) => StatusCode::ConnectionLost,
            Error::Io(err) => match err.kind() {
                std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
            _ => StatusCode::Failure,
        }
    }

    /// Message safe to hand to the remote client. Backend and configuration
    /// detail stays in the server log.
    pub fn client_message(&self) -> String {
        match self {
            Error::Auth(_) => "Authentication failed".to_string(),
            Error::PermissionDenied(_) => "Permission denied".to_string(),
            Error::Config(_) => "Server configuration error".to_string(),
            Error::Storage(_) => "Storage backend error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

impl From<russh_keys::Error> for Error {
    fn from(err: russh_keys::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatusCode;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            Error::not_found("/x").status_code(),
            StatusCode::NoSuchFile
        );
        assert_eq!(
            Error::permission_denied("x").status_code(),
            StatusCode::PermissionDenied
        );
        assert_eq!(
            Error::unsupported("symlink").status_code(),
            StatusCode::OpUnsupported
        );
        assert_eq!(
            Error::protocol("bad frame").status_code(),
            StatusCode::BadMessage
        );
        assert_eq!(
            Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).status_code(),
            StatusCode::NoSuchFile
        );
    }

    #[test]
    fn test_client_messages_are_sanitized() {
        let err = Error::Config("missing host key at /etc/secret/id_ed25519".into());
        assert_eq!(err.client_message(), "Server configuration error");

        let err = Error::PermissionDenied("/srv/data/alice/.ssh".into());
        assert_eq!(err.client_message(), "Permission denied");
    }
}
