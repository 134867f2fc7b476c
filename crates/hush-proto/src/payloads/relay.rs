//! Relay payloads: subscriptions, sends, deliveries and history.

use serde::{Deserialize, Serialize};

use super::Envelope;
use crate::{ConversationId, CorrelationId, MessageId, ParticipantId};

/// Names a single conversation. Used by subscribe, unsubscribe and their
/// confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRef {
    /// Target conversation
    pub conversation_id: ConversationId,
}

/// Confirms a self-channel subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfSubscribed {
    /// Participant whose channel is now subscribed
    pub participant_id: ParticipantId,
}

/// Envelope sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Target conversation
    pub conversation_id: ConversationId,
    /// Encrypted payload
    pub envelope: Envelope,
    /// Client-chosen id; retries reuse it
    pub correlation_id: CorrelationId,
    /// Group key epoch the envelope was sealed under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    /// Participants whose self-channels should also receive this envelope.
    /// Routing hint only; never persisted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<ParticipantId>,
}

/// Envelope delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    /// Relay-assigned id
    pub id: MessageId,
    /// Conversation the envelope belongs to
    pub conversation_id: ConversationId,
    /// Encrypted payload
    pub envelope: Envelope,
    /// Persistence time (unix seconds)
    pub created_at: u64,
    /// Sender, when known to the relay session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<ParticipantId>,
    /// Group key epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

/// Persistence acknowledgement for the sender of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    /// Correlation id from the send
    pub correlation_id: CorrelationId,
    /// Relay-assigned id
    pub id: MessageId,
    /// Persistence time (unix seconds)
    pub created_at: u64,
}

/// Request for stored envelopes of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Conversation to read
    pub conversation_id: ConversationId,
    /// Only return messages after this id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<MessageId>,
    /// Maximum number of messages (capped by the relay)
    pub limit: u32,
}

/// Page of stored envelopes in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Conversation read
    pub conversation_id: ConversationId,
    /// Messages, oldest first
    pub messages: Vec<DeliveredMessage>,
    /// More messages exist past the last one returned
    pub has_more: bool,
}

/// Stored envelopes of one conversation that the relay has removed.
///
/// Sent to the conversation's subscribers so clients can drop their local
/// copies too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredMessages {
    /// Conversation the envelopes belonged to
    pub conversation_id: ConversationId,
    /// Removed message ids, ascending
    pub ids: Vec<MessageId>,
}
