//! Error types for the caching proxy

use std::io;
use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error types that can occur while relaying or caching a request
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("premature end of header: {0}")]
    PrematureEnd(String),

    #[error("malformed start line: {0}")]
    MalformedStartLine(String),

    #[error("header section exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("no route for request: {0}")]
    NoRoute(String),

    #[error("inconsistent content length: header={expected} actual={actual}")]
    InconsistentLength { expected: u64, actual: u64 },

    #[error("transfer stopped")]
    Stopped,

    #[error("invalid host:port: {0}")]
    InvalidHostport(String),

    #[error("secondary proxy refused tunnel: {0}")]
    ProxyHandshake(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("read timed out")]
    Timeout,
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl ProxyError {
    /// Whether this error is an expected consequence of a peer going away
    /// or of a deliberate stop.
    ///
    /// Such errors happen during normal operation (browser closes a tab,
    /// shutdown force-closes a socket) and are logged at debug level only.
    pub fn is_transport_error(&self) -> bool {
        match self {
            ProxyError::Stopped | ProxyError::Timeout => true,
            ProxyError::IoError(e) => is_disconnect(e),
            _ => false,
        }
    }

    /// Convert error to the status of a generated error page
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::PrematureEnd(_)
            | ProxyError::MalformedStartLine(_)
            | ProxyError::InvalidHostport(_) => 400,
            ProxyError::HeaderTooLarge(_) => 431,
            ProxyError::NoRoute(_) => 405,
            ProxyError::HttpError(_)
            | ProxyError::ProxyHandshake(_)
            | ProxyError::InconsistentLength { .. } => 502,
            ProxyError::Timeout => 504,
            _ => 500,
        }
    }
}

/// Connection reset, abort and friends.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
