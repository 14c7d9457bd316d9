//! Error types for tidepool operations.

use std::fmt;

/// The primary error type for all pool operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, authentication, driver failures)
    Connection(ConnectionError),
    /// Pool errors (exhausted, closed, lock protocol)
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled (the owning partition was interrupted)
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
    /// Prepared-statement cache could not be set up
    StatementCache,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// A partition lock could not be acquired (poisoned by a panicking holder)
    Lock,
    /// A background worker ended abnormally
    Worker,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a pool error of the given kind.
    pub fn pool(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Error::Pool(PoolError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a connection error of the given kind.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (pool exhausted, timeouts, transient connect failures)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted | PoolErrorKind::Timeout),
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::Refused
            ),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => !matches!(c.kind, ConnectionErrorKind::StatementCache),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Is this a lock-protocol failure? The watcher never retries these.
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, Error::Pool(p) if p.kind == PoolErrorKind::Lock)
    }

    /// Was the operation cancelled?
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Get the pool error kind, if this is a pool error.
    pub fn pool_kind(&self) -> Option<PoolErrorKind> {
        match self {
            Error::Pool(p) => Some(p.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_and_connection_flags() {
        let exhausted = Error::pool(PoolErrorKind::Exhausted, "pool exhausted");
        let timeout = Error::pool(PoolErrorKind::Timeout, "timed out");
        let refused = Error::connection(ConnectionErrorKind::Refused, "connection refused");

        assert!(exhausted.is_retryable());
        assert!(timeout.is_retryable());
        assert!(refused.is_retryable());
        assert!(refused.is_connection_error());

        let auth = Error::connection(ConnectionErrorKind::Authentication, "bad password");
        assert!(!auth.is_retryable());
        assert!(auth.is_connection_error());

        let cache = Error::connection(ConnectionErrorKind::StatementCache, "bad cache size");
        assert!(!cache.is_connection_error());
    }

    #[test]
    fn lock_failures_are_not_retryable() {
        let err = Error::pool(PoolErrorKind::Lock, "almost-full lock poisoned");
        assert!(err.is_lock_failure());
        assert!(!err.is_retryable());
        assert_eq!(err.pool_kind(), Some(PoolErrorKind::Lock));
        assert_eq!(err.to_string(), "Pool error: almost-full lock poisoned");
    }

    #[test]
    fn cancelled_display() {
        assert!(Error::Cancelled.is_cancelled());
        assert_eq!(Error::Cancelled.to_string(), "Operation cancelled");
        assert_eq!(Error::Cancelled.pool_kind(), None);
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Refused,
            message: "dial failed".to_string(),
            source: Some(Box::new(io)),
        });
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "refused");
    }
}
