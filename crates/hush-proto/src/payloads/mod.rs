//! CBOR-encoded protocol messages.
//!
//! The frame header's opcode identifies the payload type, so only the inner
//! struct is serialized (no variant tag). A frame whose opcode and payload
//! disagree simply fails to decode.
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode, enforced by match
//! exhaustiveness in [`Payload::opcode`], [`Payload::encode`] and
//! [`Payload::decode`].

pub mod relay;
pub mod session;

use bytes::BufMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    CorrelationId, Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
    limits::{MAX_CIPHERTEXT_BYTES, NONCE_BYTES},
};

/// Encrypted message unit: `{ciphertext, nonce}`.
///
/// The relay stores and forwards envelopes without ever inspecting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// AEAD ciphertext including the authentication tag
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// Single-use random nonce
    pub nonce: [u8; NONCE_BYTES],
}

impl Envelope {
    /// Check size limits.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidEnvelope` if the ciphertext is empty or larger
    /// than [`MAX_CIPHERTEXT_BYTES`].
    pub fn validate(&self) -> Result<()> {
        if self.ciphertext.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("ciphertext is empty".into()));
        }
        if self.ciphertext.len() > MAX_CIPHERTEXT_BYTES {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "ciphertext exceeds {MAX_CIPHERTEXT_BYTES} bytes"
            )));
        }
        Ok(())
    }
}

/// All possible frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Session
    /// Knowledge proof for a token
    Authenticate(session::Authenticate),
    /// Token granted
    AuthGranted(session::AuthGranted),
    /// Authentication refused
    AuthDenied(session::AuthDenied),
    /// Open relay session
    Hello(session::Hello),
    /// Relay session opened
    HelloReply(session::HelloReply),
    /// Client liveness ping
    Ping,
    /// Reply to ping
    Pong,
    /// Relay liveness ping
    Heartbeat,
    /// Graceful close
    Goodbye(session::Goodbye),
    /// Error report
    Error(ErrorPayload),

    // Client to relay
    /// Subscribe to a conversation
    Subscribe(relay::ConversationRef),
    /// Unsubscribe from a conversation
    Unsubscribe(relay::ConversationRef),
    /// Subscribe to own channel
    SubscribeSelf,
    /// Send an envelope
    SendMessage(relay::OutboundMessage),
    /// Read stored envelopes
    History(relay::HistoryRequest),

    // Relay to client
    /// Subscription confirmed
    Subscribed(relay::ConversationRef),
    /// Unsubscription confirmed
    Unsubscribed(relay::ConversationRef),
    /// Self subscription confirmed
    SelfSubscribed(relay::SelfSubscribed),
    /// Envelope delivery
    Message(relay::DeliveredMessage),
    /// Persistence acknowledgement
    Ack(relay::MessageAck),
    /// History response
    HistoryPage(relay::HistoryPage),
    /// Envelopes removed by retention
    Expired(relay::ExpiredMessages),
}

/// Error payload for error frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
    /// Correlation id of the send that failed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Seconds to wait before retrying, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorPayload {
    /// Malformed or out-of-limits payload.
    pub const INVALID_PAYLOAD: u16 = 0x0001;
    /// Frame requires an authenticated session.
    pub const NOT_AUTHENTICATED: u16 = 0x0002;
    /// Connection holds too many subscriptions.
    pub const SUBSCRIPTION_LIMIT: u16 = 0x0003;
    /// Send rate exceeded.
    pub const RATE_LIMITED: u16 = 0x0004;
    /// Persistence failed.
    pub const STORAGE_ERROR: u16 = 0x0005;
    /// Frame not valid in the current session state.
    pub const UNEXPECTED_FRAME: u16 = 0x0006;

    /// Create an invalid payload error.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PAYLOAD, msg)
    }

    /// Create a not-authenticated error.
    pub fn not_authenticated() -> Self {
        Self::new(Self::NOT_AUTHENTICATED, "session not authenticated")
    }

    /// Create a subscription limit error.
    pub fn subscription_limit(max: usize) -> Self {
        Self::new(Self::SUBSCRIPTION_LIMIT, format!("subscription limit of {max} reached"))
    }

    /// Create a rate limit error.
    pub fn rate_limited(retry_after: u64) -> Self {
        Self { retry_after: Some(retry_after), ..Self::new(Self::RATE_LIMITED, "rate limited") }
    }

    /// Create a storage error. The message is generic so storage details do
    /// not leak to clients.
    pub fn storage_error() -> Self {
        Self::new(Self::STORAGE_ERROR, "failed to save message")
    }

    /// Create an unexpected frame error.
    pub fn unexpected_frame(msg: impl Into<String>) -> Self {
        Self::new(Self::UNEXPECTED_FRAME, msg)
    }

    /// Attach the correlation id of the failed send.
    #[must_use]
    pub fn for_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), correlation_id: None, retry_after: None }
    }
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Authenticate(_) => Opcode::Authenticate,
            Self::AuthGranted(_) => Opcode::AuthGranted,
            Self::AuthDenied(_) => Opcode::AuthDenied,
            Self::Hello(_) => Opcode::Hello,
            Self::HelloReply(_) => Opcode::HelloReply,
            Self::Ping => Opcode::Ping,
            Self::Pong => Opcode::Pong,
            Self::Heartbeat => Opcode::Heartbeat,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Error(_) => Opcode::Error,
            Self::Subscribe(_) => Opcode::Subscribe,
            Self::Unsubscribe(_) => Opcode::Unsubscribe,
            Self::SubscribeSelf => Opcode::SubscribeSelf,
            Self::SendMessage(_) => Opcode::SendMessage,
            Self::History(_) => Opcode::History,
            Self::Subscribed(_) => Opcode::Subscribed,
            Self::Unsubscribed(_) => Opcode::Unsubscribed,
            Self::SelfSubscribed(_) => Opcode::SelfSubscribed,
            Self::Message(_) => Opcode::Message,
            Self::Ack(_) => Opcode::Ack,
            Self::HistoryPage(_) => Opcode::HistoryPage,
            Self::Expired(_) => Opcode::Expired,
        }
    }

    /// Encode payload to buffer. Only the inner struct is written.
    ///
    /// Size limits are enforced later by [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Ping | Self::Pong | Self::Heartbeat | Self::SubscribeSelf => Ok(()),
            Self::Authenticate(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::AuthGranted(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::AuthDenied(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HelloReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Goodbye(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Subscribe(inner)
            | Self::Unsubscribe(inner)
            | Self::Subscribed(inner)
            | Self::Unsubscribed(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::SendMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::History(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::SelfSubscribed(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Message(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Ack(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HistoryPage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Expired(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload bytes according to `opcode`.
    ///
    /// The size check runs before any CBOR parsing.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed the frame limit
    /// - `ProtocolError::CborDecode` if deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match opcode {
            Opcode::Authenticate => Self::Authenticate(cbor(bytes)?),
            Opcode::AuthGranted => Self::AuthGranted(cbor(bytes)?),
            Opcode::AuthDenied => Self::AuthDenied(cbor(bytes)?),
            Opcode::Hello => Self::Hello(cbor(bytes)?),
            Opcode::HelloReply => Self::HelloReply(cbor(bytes)?),
            Opcode::Ping => Self::Ping,
            Opcode::Pong => Self::Pong,
            Opcode::Heartbeat => Self::Heartbeat,
            Opcode::Goodbye => Self::Goodbye(cbor(bytes)?),
            Opcode::Error => Self::Error(cbor(bytes)?),
            Opcode::Subscribe => Self::Subscribe(cbor(bytes)?),
            Opcode::Unsubscribe => Self::Unsubscribe(cbor(bytes)?),
            Opcode::SubscribeSelf => Self::SubscribeSelf,
            Opcode::SendMessage => Self::SendMessage(cbor(bytes)?),
            Opcode::History => Self::History(cbor(bytes)?),
            Opcode::Subscribed => Self::Subscribed(cbor(bytes)?),
            Opcode::Unsubscribed => Self::Unsubscribed(cbor(bytes)?),
            Opcode::SelfSubscribed => Self::SelfSubscribed(cbor(bytes)?),
            Opcode::Message => Self::Message(cbor(bytes)?),
            Opcode::Ack => Self::Ack(cbor(bytes)?),
            Opcode::HistoryPage => Self::HistoryPage(cbor(bytes)?),
            Opcode::Expired => Self::Expired(cbor(bytes)?),
        };

        Ok(payload)
    }

    /// Convert payload into a transport frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(Frame::new(FrameHeader::new(self.opcode()), buf))
    }

    /// Parse payload from a transport frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the opcode is not recognized
    /// - Errors from [`Payload::decode`]
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}

fn cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
