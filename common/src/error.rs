use std::io;

use thiserror::Error;

/// Coarse failure classes surfaced by the network and update path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A blocking read or connect ran out of time. Retryable.
    Timeout,
    /// The peer answered with something we could not use.
    Protocol,
    /// A bounded buffer would have been exceeded.
    ResourceExceeded,
    /// Settings are missing or malformed.
    Config,
    /// No usable network path.
    Connectivity,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("response body exceeded {limit} bytes")]
    ResourceExceeded { limit: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("network unavailable: {0}")]
    Connectivity(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("sha256 mismatch (expected {expected}, got {actual})")]
    Integrity { expected: String, actual: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::Timeout,
            Self::Protocol(_) | Self::Status(_) | Self::Storage(_) | Self::Integrity { .. } => {
                ErrorKind::Protocol
            }
            Self::ResourceExceeded { .. } => ErrorKind::ResourceExceeded,
            Self::Config(_) => ErrorKind::Config,
            Self::Connectivity(_) => ErrorKind::Connectivity,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Classifies a socket-level I/O error.
    pub fn from_socket(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe => Self::Connectivity(err.to_string()),
            _ => Self::Protocol(err.to_string()),
        }
    }

    /// Classifies a local filesystem error.
    pub fn from_storage(err: io::Error) -> Self {
        Self::Storage(err.to_string())
    }

    /// Short form used in update failure reports, e.g. `http_404`.
    pub fn short_code(&self) -> String {
        match self {
            Self::Status(code) => format!("http_{code}"),
            Self::Timeout => "timeout".to_string(),
            Self::ResourceExceeded { .. } => "too_large".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write config: {0}")]
    Write(#[source] io::Error),

    #[error("config document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config backend error: {0}")]
    Backend(String),
}
