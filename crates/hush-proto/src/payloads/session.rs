//! Session-layer payloads: authentication, handshake and close.

use serde::{Deserialize, Serialize};

use crate::ParticipantId;

/// Knowledge proof of the shared passphrase, exchanged for a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticate {
    /// SHA-256 of the normalized passphrase
    #[serde(with = "serde_bytes")]
    pub proof: Vec<u8>,
    /// Identifier the token will be bound to
    pub participant_id: ParticipantId,
}

/// Successful authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthGranted {
    /// Opaque session token to present in [`Hello`]
    pub token: String,
    /// Public salt for local vault key derivation
    #[serde(with = "serde_bytes")]
    pub kdf_salt: Vec<u8>,
    /// Token expiry (unix seconds)
    pub expires_at: u64,
}

/// Why authentication was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialReason {
    /// Proof did not match. Carries attempts left before the defense policy
    /// fires, when the deployment chooses to reveal it.
    InvalidProof {
        /// Attempts remaining, if disclosed
        remaining_attempts: Option<u32>,
    },
    /// Source address is blocked
    Blocked {
        /// Block expiry (unix seconds); `None` means permanent
        expires_at: Option<u64>,
    },
    /// Too many attempts in a short time
    RateLimited {
        /// Seconds until the next attempt is accepted
        retry_after: u64,
    },
}

/// Failed authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDenied {
    /// Reason for the refusal
    pub reason: DenialReason,
}

/// Opens a relay session with a previously granted token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Token from [`AuthGranted`]
    pub token: String,
}

/// Relay session opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Relay-assigned session id
    pub session_id: u64,
    /// Participant the token was bound to
    pub participant_id: ParticipantId,
    /// Interval at which the relay sends heartbeats
    pub heartbeat_interval_secs: u64,
}

/// Graceful close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Human-readable reason
    pub reason: String,
}
