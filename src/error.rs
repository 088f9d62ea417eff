//! Error types for usenetsync

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Article not found: {0}")]
    NotFound(String),

    #[error("Integrity failure: {0}")]
    Integrity(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation not permitted: {0}")]
    Policy(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Machine-readable error kind exposed on session rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    Protocol,
    Auth,
    NotFound,
    Integrity,
    Crypto,
    Storage,
    Conflict,
    Config,
    Cancelled,
    Policy,
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Error::Policy(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Auth(_) => ErrorKind::Auth,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Storage(_) | Error::Serialization(_) => ErrorKind::Storage,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Config(_) => ErrorKind::Config,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Policy(_) => ErrorKind::Policy,
        }
    }

    /// Whether a wire-level retry with backoff is worthwhile.
    ///
    /// Integrity and crypto failures are never retried; they indicate
    /// corruption or a security-relevant anomaly. Auth failures abort the
    /// session instead of burning the retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_) | Error::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::crypto("rng").kind(), ErrorKind::Crypto);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::Conflict("busy".into()).kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::protocol("440 posting failed").is_transient());
        assert!(!Error::integrity("crc mismatch").is_transient());
        assert!(!Error::Auth("bad credentials".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }
}
