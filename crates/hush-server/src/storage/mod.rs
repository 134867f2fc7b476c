//! Storage abstraction for the relay.
//!
//! Trait-based abstraction for persisting opaque envelopes and the defense
//! engine's bookkeeping. The trait is synchronous (no async) so the relay
//! driver stays a plain state machine.
//!
//! Two families of tables live behind it:
//!
//! - conversation data: envelopes keyed by message id, a per-conversation
//!   index and the correlation index that makes sends idempotent. Nothing
//!   here can describe plaintext or participants.
//! - security bookkeeping: failure counters and blocks keyed by source
//!   address. A data wipe never touches these.

mod error;
mod memory;
mod redb;

use std::net::IpAddr;

pub use error::StorageError;
use hush_proto::{
    ConversationId, CorrelationId, Envelope, MessageId, ParticipantId,
    payloads::relay::DeliveredMessage,
};
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// A send about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// Conversation the envelope belongs to
    pub conversation_id: ConversationId,
    /// Client-chosen id used to detect retried sends
    pub correlation_id: CorrelationId,
    /// Opaque envelope
    pub envelope: Envelope,
    /// Group key epoch, if any
    pub epoch: Option<u64>,
    /// Unix seconds at which the relay accepted the send
    pub created_at: u64,
    /// Unix seconds after which the envelope may be purged. `None` keeps it.
    pub expires_at: Option<u64>,
}

/// Envelope as persisted by the relay.
///
/// Holds ciphertext, nonce, timestamp and epoch only. The sender is attached
/// to live deliveries but never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Relay-assigned id
    pub id: MessageId,
    /// Conversation the envelope belongs to
    pub conversation_id: ConversationId,
    /// Opaque envelope
    pub envelope: Envelope,
    /// Unix seconds at which the relay accepted the send
    pub created_at: u64,
    /// Group key epoch, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    /// Unix seconds after which the envelope may be purged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl StoredMessage {
    fn from_draft(id: MessageId, draft: &MessageDraft) -> Self {
        Self {
            id,
            conversation_id: draft.conversation_id,
            envelope: draft.envelope.clone(),
            created_at: draft.created_at,
            epoch: draft.epoch,
            expires_at: draft.expires_at,
        }
    }

    /// Wire form for delivery, optionally tagged with the live sender.
    pub fn to_delivered(&self, sender_id: Option<ParticipantId>) -> DeliveredMessage {
        DeliveredMessage {
            id: self.id,
            conversation_id: self.conversation_id,
            envelope: self.envelope.clone(),
            created_at: self.created_at,
            sender_id,
            epoch: self.epoch,
        }
    }
}

/// Result of persisting a [`MessageDraft`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// First time this correlation id was seen in the conversation
    Stored(StoredMessage),
    /// Retried send; the previously stored message is returned unchanged
    Duplicate(StoredMessage),
}

impl StoreOutcome {
    /// The persisted message, new or existing.
    pub fn message(&self) -> &StoredMessage {
        match self {
            Self::Stored(message) | Self::Duplicate(message) => message,
        }
    }
}

/// Envelope removed by [`Storage::purge_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpiredMessage {
    /// Conversation the envelope belonged to
    pub conversation_id: ConversationId,
    /// Relay-assigned id
    pub id: MessageId,
}

/// Outcome of an atomic failure increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTally {
    /// Consecutive failures including this one
    pub count: u32,
    /// Whether this failure reached the threshold. At most one concurrent
    /// caller observes `true` per crossing; the stored counter is reset in the
    /// same step.
    pub crossed: bool,
}

/// Consecutive authentication failures from one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Failures since the last success or fired action
    pub count: u32,
    /// Unix seconds of the latest failure
    pub last_failure: u64,
}

/// Block placed on an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Unix seconds when the block was placed
    pub blocked_at: u64,
    /// Unix seconds when the block lapses. `None` is permanent.
    pub expires_at: Option<u64>,
}

impl BlockRecord {
    /// Whether the block has lapsed at `now_secs`.
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.expires_at.is_some_and(|expires_at| now_secs >= expires_at)
    }
}

/// Storage abstraction for envelopes and security bookkeeping.
///
/// Must be Clone (shared between the driver and tests), Send + Sync and
/// synchronous. Implementations share internal state via Arc, so clones
/// access the same underlying storage.
///
/// # Atomicity
///
/// [`Storage::store_message`] and [`Storage::record_failure`] are
/// read-modify-write operations and must be atomic: concurrent callers never
/// lose an update and never both observe "first".
pub trait Storage: Clone + Send + Sync + 'static {
    /// Persist an envelope unless its correlation id was already seen in the
    /// conversation.
    ///
    /// Message ids increase monotonically across the whole store and are
    /// never reused, not even after a wipe.
    fn store_message(&self, draft: &MessageDraft) -> Result<StoreOutcome, StorageError>;

    /// Stored envelopes of a conversation in insertion order, strictly after
    /// `after` when given, at most `limit` of them.
    fn load_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError>;

    /// Total number of stored envelopes.
    fn message_count(&self) -> Result<u64, StorageError>;

    /// Remove up to `limit` envelopes whose expiry is at or before
    /// `now_secs`, earliest expiry first.
    ///
    /// The envelope, its conversation index entry and its correlation entry
    /// go in one step, so a later send reusing the correlation id is stored
    /// as new.
    fn purge_expired(
        &self,
        now_secs: u64,
        limit: usize,
    ) -> Result<Vec<ExpiredMessage>, StorageError>;

    /// Erase every envelope, conversation index and correlation entry.
    ///
    /// Failure counters and blocks survive. Returns the number of erased
    /// envelopes.
    fn wipe_conversations(&self) -> Result<u64, StorageError>;

    /// Atomically count one failure from `addr`.
    ///
    /// When the new count reaches `threshold` the stored counter is reset
    /// and the returned tally is marked `crossed`.
    fn record_failure(
        &self,
        addr: IpAddr,
        now_secs: u64,
        threshold: u32,
    ) -> Result<FailureTally, StorageError>;

    /// Current failure record for `addr`.
    fn load_failures(&self, addr: IpAddr) -> Result<Option<FailureRecord>, StorageError>;

    /// Reset the failure counter for `addr`.
    fn clear_failures(&self, addr: IpAddr) -> Result<(), StorageError>;

    /// Current block on `addr`, expired or not.
    fn load_block(&self, addr: IpAddr) -> Result<Option<BlockRecord>, StorageError>;

    /// Place or replace a block on `addr`.
    fn store_block(&self, addr: IpAddr, block: &BlockRecord) -> Result<(), StorageError>;

    /// Lift the block on `addr`, if any.
    fn remove_block(&self, addr: IpAddr) -> Result<(), StorageError>;
}

/// Apply one failure to a record. Shared by both backends so the crossing
/// rule is identical.
fn tally_failure(
    current: Option<FailureRecord>,
    now_secs: u64,
    threshold: u32,
) -> (FailureTally, FailureRecord) {
    let count = current.map_or(0, |record| record.count).saturating_add(1);
    let crossed = count >= threshold.max(1);

    let next = FailureRecord { count: if crossed { 0 } else { count }, last_failure: now_secs };
    (FailureTally { count, crossed }, next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_crosses_at_threshold_and_resets() {
        let (tally, next) = tally_failure(None, 10, 3);
        assert_eq!(tally, FailureTally { count: 1, crossed: false });
        assert_eq!(next.count, 1);

        let (tally, next) = tally_failure(Some(FailureRecord { count: 2, last_failure: 9 }), 10, 3);
        assert_eq!(tally, FailureTally { count: 3, crossed: true });
        assert_eq!(next.count, 0);
        assert_eq!(next.last_failure, 10);
    }

    #[test]
    fn tally_with_zero_threshold_behaves_like_one() {
        let (tally, _) = tally_failure(None, 0, 0);
        assert!(tally.crossed);
    }

    #[test]
    fn block_expiry() {
        let temporary = BlockRecord { blocked_at: 0, expires_at: Some(100) };
        assert!(!temporary.is_expired(99));
        assert!(temporary.is_expired(100));

        let permanent = BlockRecord { blocked_at: 0, expires_at: None };
        assert!(!permanent.is_expired(u64::MAX));
    }
}
