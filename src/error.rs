use crate::http::HttpError;
use crate::storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Stable error classification shared by every component.
///
/// The labels are what ends up in logs and metrics, so they must not change
/// when the underlying error types are reorganised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    RateLimited,
    Transient,
    Parse,
    Storage,
    Config,
    Shutdown,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "AuthError",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Transient => "TransientError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Storage => "StorageError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Shutdown => "Shutdown",
        }
    }

    /// Whether a worker hitting this error should keep ticking.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Transient | ErrorKind::Parse | ErrorKind::Storage
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] HttpError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("shutdown requested")]
    Shutdown,
}

impl ConnectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::Auth(_) => ErrorKind::Auth,
            ConnectorError::Transient(_) => ErrorKind::Transient,
            ConnectorError::Parse(_) => ErrorKind::Parse,
            ConnectorError::Config(_) => ErrorKind::Config,
            ConnectorError::Http(e) => e.kind(),
            ConnectorError::Storage(_) => ErrorKind::Storage,
            ConnectorError::Shutdown => ErrorKind::Shutdown,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
