//! Local blob store contract.
//!
//! The client persists only opaque bytes: queued envelopes, wrapped keys,
//! cached history. How and where they land (browser storage, a file, an
//! encrypted database) is the embedder's business; the client needs `get`,
//! `put` and `delete` by key and nothing more.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::error::StoreError;

/// Byte-blob key-value store.
///
/// Synchronous so the session stays a plain state machine. Implementations
/// share state between clones.
pub trait BlobStore: Clone + Send + Sync + 'static {
    /// Read a blob.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a blob, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a blob. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory [`BlobStore`] for tests and ephemeral sessions.
///
/// Uses `lock().expect()`, which panics if the mutex is poisoned.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("Mutex poisoned").len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[allow(clippy::expect_used)]
impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.lock().expect("Mutex poisoned").get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.blobs.lock().expect("Mutex poisoned").insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.lock().expect("Mutex poisoned").remove(key);
        Ok(())
    }
}
