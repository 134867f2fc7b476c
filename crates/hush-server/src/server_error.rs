//! Driver error types.
//!
//! Errors the relay driver returns to the runtime. Everything a client can
//! cause is answered with an `error` frame instead and never surfaces here;
//! these are the cases the runtime has to log or act on.

use std::fmt;

use hush_core::ConnectionError;

use crate::storage::StorageError;

/// Errors that can occur while the driver processes an event.
#[derive(Debug)]
pub enum DriverError {
    /// Session not found in the registry.
    ///
    /// Usually an event racing a disconnect. Transient.
    SessionNotFound(u64),

    /// Session already registered.
    ///
    /// Session ids are random 64-bit values; a collision is a runtime bug.
    SessionAlreadyExists(u64),

    /// Operation requires an authenticated session.
    NotAuthenticated(u64),

    /// Storage operation failed.
    ///
    /// May be transient (I/O) or fatal (corrupt record). See
    /// [`StorageError::is_transient`].
    Storage(StorageError),

    /// Session state machine rejected a transition.
    Connection(ConnectionError),

    /// Frame encoding failed.
    ///
    /// The driver only encodes payloads it built itself, so this indicates a
    /// bug (for example an envelope that slipped past validation).
    Protocol(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::SessionAlreadyExists(id) => write!(f, "session already exists: {id}"),
            Self::NotAuthenticated(id) => write!(f, "session not authenticated: {id}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Connection(err) => write!(f, "connection error: {err}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            Self::Connection(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for DriverError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<ConnectionError> for DriverError {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<hush_proto::ProtocolError> for DriverError {
    fn from(err: hush_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
