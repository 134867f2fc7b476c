//! Client error types

use hush_crypto::CryptoError;
use hush_proto::ProtocolError;
use thiserror::Error;

/// Errors from the local blob store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Underlying storage failed
    #[error("blob store I/O error: {0}")]
    Io(String),
}

/// Errors from the offline delivery queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Persisted queue could not be encoded or decoded
    #[error("queue serialization error: {0}")]
    Serialization(String),

    /// Blob store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Whether retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(StoreError::Io(_)))
    }
}

/// Errors returned by the client session and vault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Vault holds no key
    #[error("vault is locked")]
    VaultLocked,

    /// Operation needs a ready relay session
    #[error("not connected to the relay")]
    NotConnected,

    /// Key derivation or record encoding failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Frame could not be built or parsed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Offline queue failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Group epochs only move forward
    #[error("epoch {requested} is older than current epoch {current}")]
    StaleEpoch {
        /// Epoch the caller tried to install
        requested: u64,
        /// Epoch already installed
        current: u64,
    },

    /// Blocking worker died before finishing
    #[error("background task failed: {0}")]
    Background(String),
}
