//! Vault and conversation key derivation.
//!
//! The vault key comes from the shared passphrase through Argon2id with fixed,
//! versioned parameters. Conversation keys are expanded from the vault key
//! with HKDF-SHA256, so any holder of the vault key derives the same key for
//! the same context without a key exchange.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hush_proto::{GroupId, ParticipantId};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Epoch used for direct (two-party) conversations.
pub const DIRECT_EPOCH: u64 = 1;

/// Separator between sorted participant ids. Participant ids cannot contain
/// control characters, so the join is unambiguous.
pub(crate) const ID_DELIMITER: u8 = 0x1f;

const MIN_SALT_LEN: usize = 8;
const KEY_LEN: usize = 32;

const DIRECT_CONTEXT_LABEL: &[u8] = b"hush/direct/v1";
const GROUP_CONTEXT_LABEL: &[u8] = b"hush/group/v1";
const CONVERSATION_KEY_INFO: &[u8] = b"hush/conversation-key/v1";

/// Argon2id cost parameters.
///
/// Parameters are bound to a vault for its whole life: records encrypted
/// under one set cannot be read with keys derived under another, and the
/// relay holds nothing to re-encrypt them with. New parameter sets get a new
/// constant, never an edit of an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl KdfParams {
    /// Version 1: 64 MiB, 3 passes, 4 lanes. Around one to three seconds on
    /// commodity hardware.
    pub const V1: Self = Self { memory_kib: 64 * 1024, iterations: 3, parallelism: 4 };

    /// Minimal parameters for tests. Never use for a real vault.
    #[must_use]
    pub const fn insecure_for_tests() -> Self {
        Self { memory_kib: 64, iterations: 1, parallelism: 1 }
    }
}

/// Root symmetric key derived from the shared passphrase.
///
/// Lives only in process memory and is zeroized on drop. Deliberately not
/// `Clone`: the vault owns the single copy.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct VaultKey([u8; KEY_LEN]);

impl VaultKey {
    /// Wrap raw key bytes, e.g. after unwrapping a locally persisted copy.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// Per-conversation symmetric key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey([u8; KEY_LEN]);

impl ConversationKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

/// Canonical passphrase form: lowercase, trimmed, single spaces.
///
/// Both the knowledge proof and the vault key are computed from this form.
/// Any divergence between the two makes a correct passphrase fail silently.
#[must_use]
pub fn normalize_passphrase(passphrase: &str) -> Zeroizing<String> {
    let lowered = Zeroizing::new(passphrase.to_lowercase());
    let words: Vec<&str> = lowered.split_whitespace().collect();
    Zeroizing::new(words.join(" "))
}

/// Proof of passphrase knowledge: SHA-256 of the normalized passphrase.
///
/// This is what the relay compares against its configured hash. It is not a
/// key and reveals nothing usable for decryption without the salt-bound KDF.
#[must_use]
pub fn knowledge_proof(passphrase: &str) -> [u8; 32] {
    let normalized = normalize_passphrase(passphrase);
    Sha256::digest(normalized.as_bytes()).into()
}

/// Derive the vault key from a passphrase and the relay-supplied salt.
///
/// Expensive by design. Callers on an async runtime must run this on a
/// blocking worker.
///
/// # Errors
///
/// - `CryptoError::SaltTooShort` for salts under 8 bytes
/// - `CryptoError::Kdf` if Argon2 rejects `params`
pub fn derive_vault_key(
    passphrase: &str,
    salt: &[u8],
    params: KdfParams,
) -> Result<VaultKey, CryptoError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::SaltTooShort { min: MIN_SALT_LEN, actual: salt.len() });
    }

    let argon_params =
        Params::new(params.memory_kib, params.iterations, params.parallelism, Some(KEY_LEN))
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let normalized = normalize_passphrase(passphrase);
    let mut output = [0u8; KEY_LEN];
    argon
        .hash_password_into(normalized.as_bytes(), salt, &mut output)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;

    let key = VaultKey(output);
    output.zeroize();
    Ok(key)
}

/// Derive the key for a conversation identified by its participant set.
///
/// Ids are sorted and deduplicated first, so every participant derives the
/// same key independently. Direct conversations pass [`DIRECT_EPOCH`].
#[must_use]
pub fn derive_conversation_key(
    vault_key: &VaultKey,
    participant_ids: &[ParticipantId],
    epoch: u64,
) -> ConversationKey {
    let mut hasher = Sha256::new();
    hasher.update(DIRECT_CONTEXT_LABEL);
    hasher.update(sorted_participants(participant_ids));
    hasher.update([ID_DELIMITER]);
    hasher.update(epoch.to_be_bytes());

    expand(vault_key, &hasher.finalize())
}

/// Derive the key for one epoch of a group conversation.
///
/// Every epoch stays derivable, so history from earlier epochs remains
/// readable after a membership change.
#[must_use]
pub fn derive_group_key(vault_key: &VaultKey, group_id: GroupId, epoch: u64) -> ConversationKey {
    let mut hasher = Sha256::new();
    hasher.update(GROUP_CONTEXT_LABEL);
    hasher.update(group_id.0);
    hasher.update(epoch.to_be_bytes());

    expand(vault_key, &hasher.finalize())
}

/// Sorted, deduplicated ids joined with [`ID_DELIMITER`].
pub(crate) fn sorted_participants(participant_ids: &[ParticipantId]) -> Vec<u8> {
    let mut ids: Vec<&str> = participant_ids.iter().map(ParticipantId::as_str).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut joined = Vec::with_capacity(ids.iter().map(|id| id.len() + 1).sum());
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            joined.push(ID_DELIMITER);
        }
        joined.extend_from_slice(id.as_bytes());
    }
    joined
}

fn expand(vault_key: &VaultKey, context: &[u8]) -> ConversationKey {
    let Ok(hkdf) = Hkdf::<Sha256>::from_prk(&vault_key.0) else {
        unreachable!("32-byte vault key is a valid HKDF-SHA256 PRK");
    };

    let mut info = Vec::with_capacity(CONVERSATION_KEY_INFO.len() + context.len());
    info.extend_from_slice(CONVERSATION_KEY_INFO);
    info.extend_from_slice(context);

    let mut key = [0u8; KEY_LEN];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    let key_out = ConversationKey(key);
    key.zeroize();
    key_out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn vault() -> VaultKey {
        VaultKey::from_bytes([0x42; 32])
    }

    #[test]
    fn normalization_collapses_case_and_whitespace() {
        assert_eq!(
            normalize_passphrase("  Alpha   BRAVO\tcharlie\n").as_str(),
            "alpha bravo charlie"
        );
    }

    #[test]
    fn proof_matches_across_spellings() {
        assert_eq!(knowledge_proof("alpha bravo"), knowledge_proof(" ALPHA  Bravo "));
        assert_ne!(knowledge_proof("alpha bravo"), knowledge_proof("alpha bravo charlie"));
    }

    #[test]
    fn vault_key_is_deterministic() {
        let params = KdfParams::insecure_for_tests();
        let a = derive_vault_key("alpha bravo", b"saltsaltsalt", params).unwrap();
        let b = derive_vault_key("Alpha  Bravo", b"saltsaltsalt", params).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn salt_changes_vault_key() {
        let params = KdfParams::insecure_for_tests();
        let a = derive_vault_key("alpha bravo", b"saltsaltsalt", params).unwrap();
        let b = derive_vault_key("alpha bravo", b"othersaltsalt", params).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn short_salt_rejected() {
        let result = derive_vault_key("alpha", b"short", KdfParams::insecure_for_tests());
        assert_eq!(result.unwrap_err(), CryptoError::SaltTooShort { min: 8, actual: 5 });
    }

    #[test]
    fn conversation_key_ignores_order() {
        let ab = derive_conversation_key(&vault(), &[pid("alice"), pid("bob")], DIRECT_EPOCH);
        let ba = derive_conversation_key(&vault(), &[pid("bob"), pid("alice")], DIRECT_EPOCH);
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn conversation_key_depends_on_epoch_and_members() {
        let members = [pid("alice"), pid("bob")];
        let epoch_1 = derive_conversation_key(&vault(), &members, 1);
        let epoch_2 = derive_conversation_key(&vault(), &members, 2);
        let other = derive_conversation_key(&vault(), &[pid("alice"), pid("carol")], 1);

        assert_ne!(epoch_1.as_bytes(), epoch_2.as_bytes());
        assert_ne!(epoch_1.as_bytes(), other.as_bytes());
    }

    #[test]
    fn delimiter_prevents_join_collisions() {
        let split = derive_conversation_key(&vault(), &[pid("ab"), pid("c")], 1);
        let joined = derive_conversation_key(&vault(), &[pid("a"), pid("bc")], 1);
        assert_ne!(split.as_bytes(), joined.as_bytes());
    }

    #[test]
    fn group_epochs_stay_derivable() {
        let group = GroupId([7; 16]);
        let old = derive_group_key(&vault(), group, 3);
        let again = derive_group_key(&vault(), group, 3);
        let current = derive_group_key(&vault(), group, 4);

        assert_eq!(old.as_bytes(), again.as_bytes());
        assert_ne!(old.as_bytes(), current.as_bytes());
    }

    #[test]
    fn debug_never_prints_key_bytes() {
        assert_eq!(format!("{:?}", vault()), "VaultKey(..)");
    }
}
