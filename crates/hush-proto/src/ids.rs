//! Opaque identifiers.
//!
//! None of these can be reversed into anything meaningful by the relay:
//! participant ids are caller-chosen opaque strings, conversation ids are
//! one-way digests, and message/correlation ids are random or sequential
//! numbers.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Maximum length of a participant identifier in bytes.
pub const MAX_PARTICIPANT_ID_LEN: usize = 128;

/// Opaque participant identifier.
///
/// Non-empty, at most [`MAX_PARTICIPANT_ID_LEN`] bytes and free of control
/// characters. Validation runs on construction and on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Validate and wrap a participant identifier.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidIdentifier` if empty, too long or containing
    /// control characters.
    pub fn new(value: impl Into<String>) -> Result<Self, ProtocolError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ProtocolError::InvalidIdentifier("participant id is empty".into()));
        }
        if value.len() > MAX_PARTICIPANT_ID_LEN {
            return Err(ProtocolError::InvalidIdentifier(format!(
                "participant id exceeds {MAX_PARTICIPANT_ID_LEN} bytes"
            )));
        }
        if value.chars().any(char::is_control) {
            return Err(ProtocolError::InvalidIdentifier(
                "participant id contains control characters".into(),
            ));
        }
        Ok(Self(value))
    }

    /// Identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One-way digest identifying a conversation.
///
/// Used as the relay subscription key and the storage key. Direct
/// conversations derive it from the sorted participant set, groups from their
/// explicit [`GroupId`]; the derivation lives in `hush-crypto`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub [u8; 32]);

impl ConversationId {
    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationId({}..)", &hex::encode(&self.0[..6]))
    }
}

impl FromStr for ConversationId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ProtocolError::InvalidIdentifier(format!("conversation id: {e}")))?;
        Ok(Self(bytes))
    }
}

/// Explicit identifier of a group conversation.
///
/// Groups cannot be keyed by their participant set because membership
/// changes; the creator picks a random `GroupId` once.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub [u8; 16]);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({self})")
    }
}

/// Relay-assigned message identifier, monotonically increasing per relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen identifier attached to a send.
///
/// Doubles as the offline queue's local id: a retried send reuses it, which
/// is what makes the relay's persistence idempotent.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub [u8; 16]);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_id_validation() {
        assert!(ParticipantId::new("alice").is_ok());
        assert!(ParticipantId::new("").is_err());
        assert!(ParticipantId::new("a".repeat(MAX_PARTICIPANT_ID_LEN + 1)).is_err());
        assert!(ParticipantId::new("bad\nid").is_err());
    }

    #[test]
    fn participant_id_rejected_on_deserialize() {
        let mut buf = Vec::new();
        ciborium::into_writer(&String::new(), &mut buf).unwrap();

        let result: Result<ParticipantId, _> = ciborium::from_reader(buf.as_slice());
        assert!(result.is_err());
    }

    #[test]
    fn conversation_id_hex_round_trip() {
        let id = ConversationId([0xAB; 32]);
        let parsed: ConversationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        assert!("zz".parse::<ConversationId>().is_err());
    }
}
