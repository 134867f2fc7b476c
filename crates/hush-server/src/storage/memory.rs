#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::{Arc, Mutex},
};

use hush_proto::{ConversationId, CorrelationId, MessageId};

use super::{
    BlockRecord, ExpiredMessage, FailureRecord, FailureTally, MessageDraft, Storage, StorageError,
    StoreOutcome, StoredMessage, tally_failure,
};

/// In-memory storage implementation for testing and ephemeral relays.
///
/// All state is wrapped in `Arc<Mutex<>>` so clones share it and every
/// read-modify-write runs under a single lock. Uses `lock().expect()`, which
/// panics if the mutex is poisoned.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// Last assigned message id; survives wipes
    last_message_id: u64,

    /// Envelopes by id
    messages: BTreeMap<u64, StoredMessage>,

    /// Conversation -> message ids in insertion order
    conversations: HashMap<ConversationId, Vec<u64>>,

    /// (conversation, correlation) -> message id
    correlations: HashMap<(ConversationId, CorrelationId), u64>,

    /// (expires_at, message id) -> correlation id
    expiries: BTreeMap<(u64, u64), CorrelationId>,

    failures: HashMap<IpAddr, FailureRecord>,
    blocks: HashMap<IpAddr, BlockRecord>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStorageInner::default())) }
    }

    /// Number of conversations with stored envelopes.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn conversation_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").conversations.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn store_message(&self, draft: &MessageDraft) -> Result<StoreOutcome, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let key = (draft.conversation_id, draft.correlation_id);
        if let Some(id) = inner.correlations.get(&key) {
            let existing = inner
                .messages
                .get(id)
                .cloned()
                .ok_or_else(|| StorageError::Serialization("dangling correlation".into()))?;
            return Ok(StoreOutcome::Duplicate(existing));
        }

        let id = inner.last_message_id.checked_add(1).ok_or(StorageError::IdsExhausted)?;
        inner.last_message_id = id;

        let message = StoredMessage::from_draft(MessageId(id), draft);

        inner.messages.insert(id, message.clone());
        inner.conversations.entry(draft.conversation_id).or_default().push(id);
        inner.correlations.insert(key, id);
        if let Some(expires_at) = draft.expires_at {
            inner.expiries.insert((expires_at, id), draft.correlation_id);
        }

        Ok(StoreOutcome::Stored(message))
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn load_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some(ids) = inner.conversations.get(&conversation_id) else {
            return Ok(Vec::new());
        };

        let after = after.map_or(0, |id| id.0);
        Ok(ids
            .iter()
            .filter(|id| **id > after)
            .filter_map(|id| inner.messages.get(id).cloned())
            .take(limit)
            .collect())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn message_count(&self) -> Result<u64, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").messages.len() as u64)
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn wipe_conversations(&self) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let erased = inner.messages.len() as u64;
        inner.messages.clear();
        inner.conversations.clear();
        inner.correlations.clear();
        inner.expiries.clear();

        Ok(erased)
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn purge_expired(
        &self,
        now_secs: u64,
        limit: usize,
    ) -> Result<Vec<ExpiredMessage>, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let due: Vec<((u64, u64), CorrelationId)> = inner
            .expiries
            .range(..=(now_secs, u64::MAX))
            .take(limit)
            .map(|(key, correlation)| (*key, *correlation))
            .collect();

        let mut purged = Vec::with_capacity(due.len());
        for (key, correlation_id) in due {
            inner.expiries.remove(&key);
            let id = key.1;

            let Some(message) = inner.messages.remove(&id) else {
                continue;
            };
            let conversation_id = message.conversation_id;

            inner.correlations.remove(&(conversation_id, correlation_id));
            if let Some(ids) = inner.conversations.get_mut(&conversation_id) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    inner.conversations.remove(&conversation_id);
                }
            }

            purged.push(ExpiredMessage { conversation_id, id: MessageId(id) });
        }

        Ok(purged)
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn record_failure(
        &self,
        addr: IpAddr,
        now_secs: u64,
        threshold: u32,
    ) -> Result<FailureTally, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let (tally, next) = tally_failure(inner.failures.get(&addr).copied(), now_secs, threshold);
        inner.failures.insert(addr, next);

        Ok(tally)
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn load_failures(&self, addr: IpAddr) -> Result<Option<FailureRecord>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").failures.get(&addr).copied())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn clear_failures(&self, addr: IpAddr) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").failures.remove(&addr);
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn load_block(&self, addr: IpAddr) -> Result<Option<BlockRecord>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").blocks.get(&addr).copied())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn store_block(&self, addr: IpAddr, block: &BlockRecord) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").blocks.insert(addr, *block);
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn remove_block(&self, addr: IpAddr) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").blocks.remove(&addr);
        Ok(())
    }
}
