//! Client events and actions.

use std::time::Duration;

use hush_proto::{
    ConversationId, CorrelationId, Frame, MessageId,
    payloads::{
        relay::{DeliveredMessage, ExpiredMessages, HistoryPage, OutboundMessage},
        session::DenialReason,
    },
};

use crate::queue::Delivered;

/// Events the caller feeds into the session.
///
/// The caller is responsible for:
/// - Reporting transport lifecycle (dial results, drops)
/// - Receiving frames from the network
/// - Driving time forward via ticks
/// - Forwarding application intents (send, subscribe, logout)
#[derive(Debug, Clone)]
pub enum ClientEvent<I = std::time::Instant> {
    /// User asked to go online. Re-enables automatic reconnection.
    Connect,

    /// The dial requested by [`ClientAction::Dial`] succeeded.
    TransportConnected,

    /// The dial failed or timed out.
    TransportFailed,

    /// An established transport dropped.
    TransportClosed {
        /// Why the transport closed, for logs
        reason: String,
    },

    /// Frame received from the relay.
    FrameReceived(Frame),

    /// Time tick for backoff timers and timeouts.
    Tick {
        /// Current time from the environment.
        now: I,
    },

    /// Follow a conversation. Survives reconnects.
    Subscribe {
        /// Conversation to follow
        conversation_id: ConversationId,
    },

    /// Stop following a conversation.
    Unsubscribe {
        /// Conversation to drop
        conversation_id: ConversationId,
    },

    /// Follow the own participant channel. Survives reconnects.
    SubscribeSelf,

    /// Send an envelope. It is queued first and transmitted when the session
    /// is ready.
    Send(OutboundMessage),

    /// Request stored envelopes.
    FetchHistory {
        /// Conversation to read
        conversation_id: ConversationId,
        /// Only messages after this id
        after: Option<MessageId>,
        /// Page size
        limit: u32,
    },

    /// Retransmit queued envelopes that are not in flight, e.g. after a
    /// connectivity change.
    Resync,

    /// Explicit logout. Disables reconnection until the next `Connect`.
    Logout,
}

/// Actions the session produces for the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Open a transport to the relay, then report
    /// [`ClientEvent::TransportConnected`] or [`ClientEvent::TransportFailed`].
    Dial,

    /// Close the transport.
    Hangup,

    /// Deliver a tick after `delay`.
    WakeAfter {
        /// Backoff delay
        delay: Duration,
    },

    /// Send a frame to the relay.
    Send(Frame),

    /// Relay accepted the passphrase proof.
    ///
    /// The salt is what the vault needs to derive the vault key.
    Authenticated {
        /// Public KDF salt
        kdf_salt: Vec<u8>,
        /// Token expiry (unix seconds)
        expires_at: u64,
    },

    /// Relay refused authentication. Reconnection is disabled.
    AuthFailed {
        /// Refusal reason as reported by the relay
        reason: DenialReason,
    },

    /// Subscriptions are re-established; new sends go out immediately.
    Ready {
        /// Relay session id
        session_id: u64,
    },

    /// Envelope delivered by the relay. Decrypt with the vault.
    Message(DeliveredMessage),

    /// A queued envelope was acknowledged.
    Delivered(Delivered),

    /// A queued envelope exhausted its attempts and was dropped.
    SendFailed {
        /// Id the envelope was queued under
        local_id: CorrelationId,
        /// Its conversation
        conversation_id: ConversationId,
    },

    /// Stored envelopes requested with [`ClientEvent::FetchHistory`].
    History(HistoryPage),

    /// The relay's retention policy removed these envelopes. Local copies
    /// should go too.
    Expired(ExpiredMessages),

    /// Reconnect attempts exhausted; the user has to connect again.
    GaveUp {
        /// Attempts made
        attempts: u32,
    },

    /// Log message for debugging.
    Log {
        /// Log message.
        message: String,
    },
}
