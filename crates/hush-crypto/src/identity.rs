//! Conversation identifiers.
//!
//! Identifiers are one-way digests: the relay uses them as subscription and
//! storage keys but cannot recover who is talking.

use hush_proto::{ConversationId, GroupId, ParticipantId};
use sha2::{Digest, Sha256};

use crate::kdf::sorted_participants;

const GROUP_ID_LABEL: &[u8] = b"hush/group-id/v1";

/// Identifier of a direct conversation: SHA-256 over the sorted,
/// delimiter-joined participant ids.
///
/// Identical no matter which participant computes it.
#[must_use]
pub fn compute_conversation_id(participant_ids: &[ParticipantId]) -> ConversationId {
    ConversationId(Sha256::digest(sorted_participants(participant_ids)).into())
}

/// Identifier of a group conversation.
///
/// Derived from the explicit group id rather than the members, because
/// membership changes over the group's life.
#[must_use]
pub fn group_conversation_id(group_id: GroupId) -> ConversationId {
    let mut hasher = Sha256::new();
    hasher.update(GROUP_ID_LABEL);
    hasher.update(group_id.0);
    ConversationId(hasher.finalize().into())
}
