//! Operation codes.

/// Identifies the payload type carried by a frame.
///
/// Session opcodes live in `0x00xx`, client-to-relay requests in `0x01xx` and
/// relay-to-client notifications in `0x02xx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Knowledge proof submitted for a session token
    Authenticate = 0x0001,
    /// Token and KDF salt granted
    AuthGranted = 0x0002,
    /// Authentication refused
    AuthDenied = 0x0003,
    /// Present a session token to open the relay session
    Hello = 0x0004,
    /// Relay session opened
    HelloReply = 0x0005,
    /// Client liveness ping
    Ping = 0x0006,
    /// Reply to [`Opcode::Ping`]
    Pong = 0x0007,
    /// Relay liveness ping
    Heartbeat = 0x0008,
    /// Graceful close
    Goodbye = 0x0009,
    /// Error report
    Error = 0x000F,

    /// Subscribe to a conversation
    Subscribe = 0x0101,
    /// Unsubscribe from a conversation
    Unsubscribe = 0x0102,
    /// Subscribe to the caller's own channel
    SubscribeSelf = 0x0103,
    /// Send an envelope to a conversation
    SendMessage = 0x0104,
    /// Request stored envelopes
    History = 0x0105,

    /// Subscription confirmed
    Subscribed = 0x0201,
    /// Unsubscription confirmed
    Unsubscribed = 0x0202,
    /// Self subscription confirmed
    SelfSubscribed = 0x0203,
    /// Envelope delivered to a subscriber
    Message = 0x0204,
    /// Envelope persisted for its sender
    Ack = 0x0205,
    /// Page of stored envelopes
    HistoryPage = 0x0206,
    /// Stored envelopes removed by the retention policy
    Expired = 0x0207,
}

impl Opcode {
    /// Raw wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a raw wire value. `None` if unrecognized.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0001 => Self::Authenticate,
            0x0002 => Self::AuthGranted,
            0x0003 => Self::AuthDenied,
            0x0004 => Self::Hello,
            0x0005 => Self::HelloReply,
            0x0006 => Self::Ping,
            0x0007 => Self::Pong,
            0x0008 => Self::Heartbeat,
            0x0009 => Self::Goodbye,
            0x000F => Self::Error,
            0x0101 => Self::Subscribe,
            0x0102 => Self::Unsubscribe,
            0x0103 => Self::SubscribeSelf,
            0x0104 => Self::SendMessage,
            0x0105 => Self::History,
            0x0201 => Self::Subscribed,
            0x0202 => Self::Unsubscribed,
            0x0203 => Self::SelfSubscribed,
            0x0204 => Self::Message,
            0x0205 => Self::Ack,
            0x0206 => Self::HistoryPage,
            0x0207 => Self::Expired,
            _ => return None,
        })
    }

    /// True for frames only the session layer handles (handshake, liveness,
    /// close). Everything else requires an authenticated session.
    #[must_use]
    pub const fn is_session(self) -> bool {
        (self as u16) < 0x0100
    }
}
