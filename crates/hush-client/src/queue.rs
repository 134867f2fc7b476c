//! Offline delivery queue.
//!
//! Every outgoing envelope is recorded here before it touches the network
//! and leaves only when the relay acknowledges persistence. The entry's
//! correlation id doubles as its local id: the relay deduplicates on it, so a
//! send retried after a lost ack is stored once, and the ack carries the
//! relay-assigned id the local record is reconciled to.
//!
//! The queue is rewritten to the [`BlobStore`] after every change, so a crash
//! loses nothing that was accepted by [`OfflineDeliveryQueue::enqueue`].

use std::{collections::VecDeque, fmt::Display, future::Future};

use hush_proto::{
    ConversationId, CorrelationId, Envelope, MessageId, ParticipantId,
    payloads::relay::{MessageAck, OutboundMessage},
};
use serde::{Deserialize, Serialize};

use crate::{error::QueueError, store::BlobStore};

/// Sends allowed per entry before it is dropped as permanently failed.
pub const MAX_ATTEMPTS: u32 = 3;

/// Blob key of the persisted queue.
pub const OUTBOX_KEY: &str = "hush/outbox/v1";

/// An envelope waiting for a relay acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Caller-assigned id, sent as the correlation id
    pub local_id: CorrelationId,
    /// Target conversation
    pub conversation_id: ConversationId,
    /// Encrypted payload
    pub envelope: Envelope,
    /// Group key epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    /// Self-channel routing hints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<ParticipantId>,
    /// Failed sends so far
    pub attempts: u32,
}

impl QueuedMessage {
    /// Wire form of this entry.
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage {
            conversation_id: self.conversation_id,
            envelope: self.envelope.clone(),
            correlation_id: self.local_id,
            epoch: self.epoch,
            recipients: self.recipients.clone(),
        }
    }
}

/// A local id reconciled with the relay's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// Id the entry was queued under
    pub local_id: CorrelationId,
    /// Conversation the envelope went to
    pub conversation_id: ConversationId,
    /// Relay-assigned id
    pub id: MessageId,
    /// Relay persistence time (unix seconds)
    pub created_at: u64,
}

/// What happened to an entry after a failed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Entry stays queued for the next drain
    Retry {
        /// Failed sends so far
        attempts: u32,
    },
    /// Attempts exhausted; the entry was removed
    Dropped(QueuedMessage),
    /// No entry with that id
    Unknown,
}

/// Result of [`OfflineDeliveryQueue::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Acknowledged entries, in queue order
    pub sent: Vec<Delivered>,
    /// Entries dropped after exhausting their attempts
    pub failed: Vec<QueuedMessage>,
    /// Entries still queued
    pub remaining: usize,
}

/// Durable FIFO of envelopes awaiting acknowledgement.
pub struct OfflineDeliveryQueue<S: BlobStore> {
    store: S,
    entries: VecDeque<QueuedMessage>,
    max_attempts: u32,
}

impl<S: BlobStore> OfflineDeliveryQueue<S> {
    /// Load the queue persisted in `store`, or start empty.
    pub fn open(store: S) -> Result<Self, QueueError> {
        let entries = match store.get(OUTBOX_KEY)? {
            Some(bytes) => ciborium::de::from_reader(bytes.as_slice())
                .map_err(|e| QueueError::Serialization(e.to_string()))?,
            None => VecDeque::new(),
        };
        Ok(Self { store, entries, max_attempts: MAX_ATTEMPTS })
    }

    /// Override the attempt limit.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }

    /// Whether an entry with this id is queued.
    pub fn contains(&self, local_id: CorrelationId) -> bool {
        self.entries.iter().any(|e| e.local_id == local_id)
    }

    /// Queue an envelope with zero attempts.
    ///
    /// Returns `false` if `local_id` is already queued; the existing entry is
    /// kept unchanged.
    pub fn enqueue(
        &mut self,
        conversation_id: ConversationId,
        envelope: Envelope,
        local_id: CorrelationId,
    ) -> Result<bool, QueueError> {
        self.enqueue_message(OutboundMessage {
            conversation_id,
            envelope,
            correlation_id: local_id,
            epoch: None,
            recipients: Vec::new(),
        })
    }

    /// Queue a full outbound message, keeping its epoch and recipients.
    pub fn enqueue_message(&mut self, message: OutboundMessage) -> Result<bool, QueueError> {
        if self.contains(message.correlation_id) {
            return Ok(false);
        }

        self.entries.push_back(QueuedMessage {
            local_id: message.correlation_id,
            conversation_id: message.conversation_id,
            envelope: message.envelope,
            epoch: message.epoch,
            recipients: message.recipients,
            attempts: 0,
        });
        self.persist()?;
        Ok(true)
    }

    /// Remove an acknowledged entry and reconcile its id.
    ///
    /// Returns `None` for acks of entries that are not queued (already
    /// reconciled, or never sent through the queue).
    pub fn acknowledge(&mut self, ack: &MessageAck) -> Result<Option<Delivered>, QueueError> {
        let Some(index) = self.position(ack.correlation_id) else {
            return Ok(None);
        };
        let Some(entry) = self.entries.remove(index) else {
            return Ok(None);
        };
        self.persist()?;

        Ok(Some(Delivered {
            local_id: entry.local_id,
            conversation_id: entry.conversation_id,
            id: ack.id,
            created_at: ack.created_at,
        }))
    }

    /// Count a failed send, dropping the entry once it reaches the limit.
    pub fn record_failure(
        &mut self,
        local_id: CorrelationId,
    ) -> Result<FailureOutcome, QueueError> {
        let Some(index) = self.position(local_id) else {
            return Ok(FailureOutcome::Unknown);
        };

        let attempts = {
            let entry = &mut self.entries[index];
            entry.attempts = entry.attempts.saturating_add(1);
            entry.attempts
        };

        let outcome = if attempts >= self.max_attempts {
            match self.entries.remove(index) {
                Some(entry) => FailureOutcome::Dropped(entry),
                None => FailureOutcome::Unknown,
            }
        } else {
            FailureOutcome::Retry { attempts }
        };

        self.persist()?;
        Ok(outcome)
    }

    /// Send every queued entry through `send`, oldest first.
    ///
    /// `send` resolves with the relay's ack once the envelope is persisted,
    /// or an error (including a timeout). Acknowledged entries are removed
    /// and reconciled; failures count an attempt, and entries that reach the
    /// limit are dropped and reported in [`DrainReport::failed`]. A failure
    /// does not stop the drain.
    pub async fn drain<F, Fut, E>(&mut self, mut send: F) -> Result<DrainReport, QueueError>
    where
        F: FnMut(OutboundMessage) -> Fut,
        Fut: Future<Output = Result<MessageAck, E>>,
        E: Display,
    {
        let mut report = DrainReport::default();
        let pending: Vec<CorrelationId> = self.entries.iter().map(|e| e.local_id).collect();

        for local_id in pending {
            let Some(outbound) = self.get(local_id).map(QueuedMessage::to_outbound) else {
                continue;
            };

            match send(outbound).await {
                Ok(ack) => {
                    let ack = MessageAck { correlation_id: local_id, ..ack };
                    if let Some(delivered) = self.acknowledge(&ack)? {
                        report.sent.push(delivered);
                    }
                },
                Err(e) => {
                    tracing::debug!("Queued send {} failed: {}", local_id, e);
                    if let FailureOutcome::Dropped(entry) = self.record_failure(local_id)? {
                        tracing::warn!(
                            "Dropping queued message {} after {} attempts",
                            entry.local_id,
                            entry.attempts
                        );
                        report.failed.push(entry);
                    }
                },
            }
        }

        report.remaining = self.entries.len();
        Ok(report)
    }

    /// Drop every entry.
    pub fn clear(&mut self) -> Result<(), QueueError> {
        self.entries.clear();
        self.store.delete(OUTBOX_KEY)?;
        Ok(())
    }

    fn get(&self, local_id: CorrelationId) -> Option<&QueuedMessage> {
        self.entries.iter().find(|e| e.local_id == local_id)
    }

    fn position(&self, local_id: CorrelationId) -> Option<usize> {
        self.entries.iter().position(|e| e.local_id == local_id)
    }

    fn persist(&self) -> Result<(), QueueError> {
        if self.entries.is_empty() {
            self.store.delete(OUTBOX_KEY)?;
            return Ok(());
        }

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&self.entries, &mut bytes)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.store.put(OUTBOX_KEY, &bytes)?;
        Ok(())
    }
}
