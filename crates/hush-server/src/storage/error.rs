//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Stored bytes could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying storage system failed (file system, database)
    #[error("I/O error: {0}")]
    Io(String),

    /// Message id space exhausted
    #[error("message id space exhausted")]
    IdsExhausted,
}

impl StorageError {
    /// Whether retrying the operation may succeed.
    ///
    /// I/O failures may be transient (disk pressure, lock contention);
    /// serialization failures indicate corrupt data and will not heal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
