//! Runtime error types.

use std::fmt;

use crate::server_error::DriverError;

/// Errors that can occur in the relay runtime.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, unreadable TLS files,
    /// malformed secrets).
    ///
    /// Fatal; prevents startup.
    Config(String),

    /// Transport/network error (connection failure, I/O error, etc.).
    ///
    /// May be transient (network issues) or fatal (bind address in use).
    Transport(String),

    /// A client sent bytes that do not form a frame.
    ///
    /// Fatal for that connection only.
    Protocol(String),

    /// Internal error (unexpected state, logic bug, etc.).
    Internal(String),

    /// Error from the relay driver.
    Driver(DriverError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::Driver(err) => write!(f, "driver error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Driver(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DriverError> for ServerError {
    fn from(err: DriverError) -> Self {
        Self::Driver(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<crate::storage::StorageError> for ServerError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::Driver(DriverError::Storage(err))
    }
}
