//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! read-modify-write (idempotent store, failure increment) runs inside one
//! write transaction, and Redb admits a single writer at a time, which is
//! what makes them atomic.

use std::{fmt::Display, net::IpAddr, path::Path, sync::Arc};

use hush_proto::{ConversationId, CorrelationId, MessageId};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{
    BlockRecord, ExpiredMessage, FailureRecord, FailureTally, MessageDraft, Storage, StorageError,
    StoreOutcome, StoredMessage, tally_failure,
};

/// Table: messages
/// Key: message id as big-endian bytes [8 bytes]
/// Value: CBOR-encoded StoredMessage
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: conversation_index
/// Key: conversation id [32 bytes] + message id BE [8 bytes]
/// Value: empty
const CONVERSATION_INDEX: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("conversation_index");

/// Table: correlations
/// Key: conversation id [32 bytes] + correlation id [16 bytes]
/// Value: message id BE [8 bytes]
const CORRELATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("correlations");

/// Table: expiries
/// Key: expires_at BE [8 bytes] + message id BE [8 bytes]
/// Value: conversation id [32 bytes] + correlation id [16 bytes]
const EXPIRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("expiries");

/// Table: meta
/// Key: UTF-8 name
/// Value: counter BE [8 bytes]
const META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

/// Table: auth_failures
/// Key: textual IP address
/// Value: CBOR-encoded FailureRecord
const FAILURES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("auth_failures");

/// Table: ip_blocks
/// Key: textual IP address
/// Value: CBOR-encoded BlockRecord
const BLOCKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ip_blocks");

const LAST_MESSAGE_ID: &[u8] = b"last_message_id";

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates all tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            for table in
                [MESSAGES, CONVERSATION_INDEX, CORRELATIONS, EXPIRIES, META, FAILURES, BLOCKS]
            {
                let _ = txn.open_table(table).map_err(io)?;
            }
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn load_record<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(table).map_err(io)?;

        match table.get(key).map_err(io)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn store_record<T: Serialize>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
        record: &T,
    ) -> Result<(), StorageError> {
        let bytes = encode(record)?;

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(table).map_err(io)?;
            table.insert(key, bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn remove_record(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(table).map_err(io)?;
            table.remove(key).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }
}

impl Storage for RedbStorage {
    fn store_message(&self, draft: &MessageDraft) -> Result<StoreOutcome, StorageError> {
        let correlation_key = encode_correlation_key(draft.conversation_id, draft.correlation_id);

        let txn = self.db.begin_write().map_err(io)?;
        let outcome = {
            let mut correlations = txn.open_table(CORRELATIONS).map_err(io)?;
            let mut messages = txn.open_table(MESSAGES).map_err(io)?;

            let existing = correlations
                .get(correlation_key.as_slice())
                .map_err(io)?
                .map(|v| v.value().to_vec());

            if let Some(id_bytes) = existing {
                let stored = messages
                    .get(id_bytes.as_slice())
                    .map_err(io)?
                    .map(|v| v.value().to_vec())
                    .ok_or_else(|| StorageError::Serialization("dangling correlation".into()))?;
                StoreOutcome::Duplicate(decode(&stored)?)
            } else {
                let mut meta = txn.open_table(META).map_err(io)?;
                let last = match meta.get(LAST_MESSAGE_ID).map_err(io)? {
                    Some(value) => decode_u64(value.value())?,
                    None => 0,
                };
                let id = last.checked_add(1).ok_or(StorageError::IdsExhausted)?;
                meta.insert(LAST_MESSAGE_ID, id.to_be_bytes().as_slice()).map_err(io)?;

                let message = StoredMessage::from_draft(MessageId(id), draft);

                let id_bytes = id.to_be_bytes();
                messages.insert(id_bytes.as_slice(), encode(&message)?.as_slice()).map_err(io)?;
                correlations
                    .insert(correlation_key.as_slice(), id_bytes.as_slice())
                    .map_err(io)?;

                let mut index = txn.open_table(CONVERSATION_INDEX).map_err(io)?;
                let index_key = encode_index_key(draft.conversation_id, id);
                index.insert(index_key.as_slice(), b"".as_slice()).map_err(io)?;

                if let Some(expires_at) = draft.expires_at {
                    let mut expiries = txn.open_table(EXPIRIES).map_err(io)?;
                    expiries
                        .insert(
                            encode_expiry_key(expires_at, id).as_slice(),
                            correlation_key.as_slice(),
                        )
                        .map_err(io)?;
                }

                StoreOutcome::Stored(message)
            }
        };
        txn.commit().map_err(io)?;

        Ok(outcome)
    }

    fn load_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let first = match after {
            Some(MessageId(id)) => match id.checked_add(1) {
                Some(next) => next,
                None => return Ok(Vec::new()),
            },
            None => 0,
        };

        let txn = self.db.begin_read().map_err(io)?;
        let index = txn.open_table(CONVERSATION_INDEX).map_err(io)?;
        let messages = txn.open_table(MESSAGES).map_err(io)?;

        let start_key = encode_index_key(conversation_id, first);
        let end_key = encode_index_key(conversation_id, u64::MAX);

        let mut page = Vec::with_capacity(limit.min(128));
        for entry in index.range(start_key.as_slice()..=end_key.as_slice()).map_err(io)? {
            if page.len() >= limit {
                break;
            }

            let (key, _) = entry.map_err(io)?;
            let id_bytes = key.value()[32..].to_vec();

            if let Some(value) = messages.get(id_bytes.as_slice()).map_err(io)? {
                page.push(decode(value.value())?);
            }
        }

        Ok(page)
    }

    fn message_count(&self) -> Result<u64, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        table.len().map_err(io)
    }

    fn wipe_conversations(&self) -> Result<u64, StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        let erased = {
            let messages = txn.open_table(MESSAGES).map_err(io)?;
            messages.len().map_err(io)?
        };

        for table in [MESSAGES, CONVERSATION_INDEX, CORRELATIONS, EXPIRIES] {
            txn.delete_table(table).map_err(io)?;
            let _ = txn.open_table(table).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(erased)
    }

    fn purge_expired(
        &self,
        now_secs: u64,
        limit: usize,
    ) -> Result<Vec<ExpiredMessage>, StorageError> {
        let end_key = encode_expiry_key(now_secs, u64::MAX);

        let txn = self.db.begin_write().map_err(io)?;
        let purged = {
            let mut expiries = txn.open_table(EXPIRIES).map_err(io)?;
            let mut due = Vec::new();
            for entry in expiries.range(..=end_key.as_slice()).map_err(io)?.take(limit) {
                let (key, value) = entry.map_err(io)?;
                due.push((key.value().to_vec(), value.value().to_vec()));
            }

            let mut messages = txn.open_table(MESSAGES).map_err(io)?;
            let mut index = txn.open_table(CONVERSATION_INDEX).map_err(io)?;
            let mut correlations = txn.open_table(CORRELATIONS).map_err(io)?;

            let mut purged = Vec::with_capacity(due.len());
            for (key, correlation_key) in due {
                expiries.remove(key.as_slice()).map_err(io)?;

                let id = decode_u64(&key[8..])?;
                let conversation_id = decode_conversation_id(&correlation_key)?;

                let removed = messages.remove(id.to_be_bytes().as_slice()).map_err(io)?.is_some();
                if !removed {
                    continue;
                }
                index
                    .remove(encode_index_key(conversation_id, id).as_slice())
                    .map_err(io)?;
                correlations.remove(correlation_key.as_slice()).map_err(io)?;

                purged.push(ExpiredMessage { conversation_id, id: MessageId(id) });
            }
            purged
        };
        txn.commit().map_err(io)?;

        Ok(purged)
    }

    fn record_failure(
        &self,
        addr: IpAddr,
        now_secs: u64,
        threshold: u32,
    ) -> Result<FailureTally, StorageError> {
        let key = addr.to_string();

        let txn = self.db.begin_write().map_err(io)?;
        let tally = {
            let mut table = txn.open_table(FAILURES).map_err(io)?;

            let current: Option<FailureRecord> = match table.get(key.as_bytes()).map_err(io)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };

            let (tally, next) = tally_failure(current, now_secs, threshold);
            table.insert(key.as_bytes(), encode(&next)?.as_slice()).map_err(io)?;
            tally
        };
        txn.commit().map_err(io)?;

        Ok(tally)
    }

    fn load_failures(&self, addr: IpAddr) -> Result<Option<FailureRecord>, StorageError> {
        self.load_record(FAILURES, addr.to_string().as_bytes())
    }

    fn clear_failures(&self, addr: IpAddr) -> Result<(), StorageError> {
        self.remove_record(FAILURES, addr.to_string().as_bytes())
    }

    fn load_block(&self, addr: IpAddr) -> Result<Option<BlockRecord>, StorageError> {
        self.load_record(BLOCKS, addr.to_string().as_bytes())
    }

    fn store_block(&self, addr: IpAddr, block: &BlockRecord) -> Result<(), StorageError> {
        self.store_record(BLOCKS, addr.to_string().as_bytes(), block)
    }

    fn remove_block(&self, addr: IpAddr) -> Result<(), StorageError> {
        self.remove_record(BLOCKS, addr.to_string().as_bytes())
    }
}

fn io(err: impl Display) -> StorageError {
    StorageError::Io(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StorageError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| {
        StorageError::Serialization(format!("expected 8 bytes, got {}", bytes.len()))
    })?;
    Ok(u64::from_be_bytes(array))
}

fn encode_index_key(conversation_id: ConversationId, id: u64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(conversation_id.as_bytes());
    key[32..].copy_from_slice(&id.to_be_bytes());
    key
}

fn encode_expiry_key(expires_at: u64, id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&expires_at.to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

fn decode_conversation_id(correlation_key: &[u8]) -> Result<ConversationId, StorageError> {
    let bytes: [u8; 32] = correlation_key
        .get(..32)
        .and_then(|prefix| prefix.try_into().ok())
        .ok_or_else(|| StorageError::Serialization("short expiry entry".into()))?;
    Ok(ConversationId(bytes))
}

fn encode_correlation_key(
    conversation_id: ConversationId,
    correlation_id: CorrelationId,
) -> [u8; 48] {
    let mut key = [0u8; 48];
    key[..32].copy_from_slice(conversation_id.as_bytes());
    key[32..].copy_from_slice(&correlation_id.0);
    key
}
