//! Client vault.
//!
//! Owns the vault key and everything derived from it. The key exists only
//! while the vault is unlocked; [`Vault::lock`] drops it together with every
//! cached conversation key, and both types zeroize on drop.
//!
//! Group epochs come from an [`EpochStore`]. Every epoch key stays derivable
//! from the vault key, so a member who missed several rotations can still
//! read history once it learns the epoch numbers; nothing has to be
//! re-shared.

use std::collections::HashMap;

use hush_core::Environment;
use hush_crypto::{
    ConversationKey, DIRECT_EPOCH, KdfParams, PlaintextRecord, VaultKey,
    compute_conversation_id, decrypt, derive_conversation_key, derive_group_key, derive_vault_key,
    encrypt, group_conversation_id,
};
use hush_proto::{ConversationId, Envelope, GroupId, ParticipantId, limits::NONCE_BYTES};
use zeroize::Zeroizing;

use crate::error::ClientError;

/// Epoch of a group that has never rotated.
pub const INITIAL_GROUP_EPOCH: u64 = 1;

/// Source of current group epochs.
///
/// Epochs only move forward. Implementations may persist them anywhere.
pub trait EpochStore: Send + 'static {
    /// Current epoch of `group_id`, if known.
    fn current_epoch(&self, group_id: GroupId) -> Option<u64>;

    /// Record a new current epoch.
    fn set_epoch(&mut self, group_id: GroupId, epoch: u64);
}

/// [`EpochStore`] kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryEpochStore {
    epochs: HashMap<GroupId, u64>,
}

impl EpochStore for MemoryEpochStore {
    fn current_epoch(&self, group_id: GroupId) -> Option<u64> {
        self.epochs.get(&group_id).copied()
    }

    fn set_epoch(&mut self, group_id: GroupId, epoch: u64) {
        self.epochs.insert(group_id, epoch);
    }
}

/// What a key is derived for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversation {
    /// Conversation keyed by its participant set
    Direct(Vec<ParticipantId>),
    /// Group keyed by its explicit id and an epoch
    Group(GroupId),
}

impl Conversation {
    /// Relay identifier of this conversation.
    pub fn id(&self) -> ConversationId {
        match self {
            Self::Direct(participants) => compute_conversation_id(participants),
            Self::Group(group_id) => group_conversation_id(*group_id),
        }
    }
}

/// An encrypted record ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// Target conversation
    pub conversation_id: ConversationId,
    /// Encrypted record
    pub envelope: Envelope,
    /// Group epoch the record was sealed under
    pub epoch: Option<u64>,
}

/// Vault key holder with a conversation key cache.
pub struct Vault<P: EpochStore = MemoryEpochStore> {
    key: Option<VaultKey>,
    params: KdfParams,
    epochs: P,
    keys: HashMap<(ConversationId, u64), ConversationKey>,
}

impl<P: EpochStore> Vault<P> {
    /// Locked vault using [`KdfParams::V1`].
    pub fn new(epochs: P) -> Self {
        Self { key: None, params: KdfParams::V1, epochs, keys: HashMap::new() }
    }

    /// Use different KDF parameters.
    #[must_use]
    pub fn with_params(mut self, params: KdfParams) -> Self {
        self.params = params;
        self
    }

    /// Whether a vault key is held.
    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    /// Derive the vault key from the passphrase and the relay's salt.
    ///
    /// Argon2 runs on a blocking worker, so awaiting this never stalls the
    /// runtime. A wrong passphrase still unlocks; it just yields a key that
    /// opens nothing.
    pub async fn unlock(&mut self, passphrase: &str, salt: &[u8]) -> Result<(), ClientError> {
        let passphrase = Zeroizing::new(passphrase.to_owned());
        let salt = salt.to_vec();
        let params = self.params;

        let key = tokio::task::spawn_blocking(move || derive_vault_key(&passphrase, &salt, params))
            .await
            .map_err(|e| ClientError::Background(e.to_string()))??;

        self.unlock_with_key(key);
        Ok(())
    }

    /// Install an already derived key.
    pub fn unlock_with_key(&mut self, key: VaultKey) {
        self.keys.clear();
        self.key = Some(key);
    }

    /// Forget the vault key and every derived key.
    pub fn lock(&mut self) {
        self.key = None;
        self.keys.clear();
    }

    /// Epoch new messages in `conversation` are sealed under. `None` for
    /// direct conversations.
    pub fn current_epoch(&self, conversation: &Conversation) -> Option<u64> {
        match conversation {
            Conversation::Direct(_) => None,
            Conversation::Group(group_id) => {
                Some(self.epochs.current_epoch(*group_id).unwrap_or(INITIAL_GROUP_EPOCH))
            },
        }
    }

    /// Rotate a group to its next epoch, e.g. after a membership change.
    pub fn advance_epoch(&mut self, group_id: GroupId) -> u64 {
        let next = self
            .epochs
            .current_epoch(group_id)
            .unwrap_or(INITIAL_GROUP_EPOCH)
            .saturating_add(1);
        self.epochs.set_epoch(group_id, next);
        next
    }

    /// Adopt an epoch learned from another member.
    pub fn install_epoch(&mut self, group_id: GroupId, epoch: u64) -> Result<(), ClientError> {
        let current = self.epochs.current_epoch(group_id).unwrap_or(INITIAL_GROUP_EPOCH);
        if epoch < current {
            return Err(ClientError::StaleEpoch { requested: epoch, current });
        }
        self.epochs.set_epoch(group_id, epoch);
        Ok(())
    }

    /// Key for `conversation` at `epoch` (current epoch when `None`).
    pub fn conversation_key(
        &mut self,
        conversation: &Conversation,
        epoch: Option<u64>,
    ) -> Result<&ConversationKey, ClientError> {
        let epoch = match conversation {
            Conversation::Direct(_) => epoch.unwrap_or(DIRECT_EPOCH),
            Conversation::Group(_) => {
                epoch.or_else(|| self.current_epoch(conversation)).unwrap_or(INITIAL_GROUP_EPOCH)
            },
        };
        let vault_key = self.key.as_ref().ok_or(ClientError::VaultLocked)?;

        let key = self.keys.entry((conversation.id(), epoch)).or_insert_with(|| {
            match conversation {
                Conversation::Direct(participants) => {
                    derive_conversation_key(vault_key, participants, epoch)
                },
                Conversation::Group(group_id) => derive_group_key(vault_key, *group_id, epoch),
            }
        });
        Ok(key)
    }

    /// Encrypt a record for `conversation` under its current epoch.
    ///
    /// The nonce is drawn from `env` for every call.
    pub fn seal(
        &mut self,
        env: &impl Environment,
        conversation: &Conversation,
        mut record: PlaintextRecord,
    ) -> Result<SealedMessage, ClientError> {
        let epoch = self.current_epoch(conversation);
        record.epoch = epoch;

        let mut nonce = [0u8; NONCE_BYTES];
        env.random_bytes(&mut nonce);

        let key = self.conversation_key(conversation, epoch)?;
        let envelope = encrypt(key, &record, nonce)?;

        Ok(SealedMessage { conversation_id: conversation.id(), envelope, epoch })
    }

    /// Decrypt an envelope, or `None` if it cannot be read.
    ///
    /// `epoch` is the epoch the relay delivered with the envelope. Locked
    /// vaults, wrong keys and damaged envelopes all yield `None`.
    pub fn open(
        &mut self,
        conversation: &Conversation,
        envelope: &Envelope,
        epoch: Option<u64>,
    ) -> Option<PlaintextRecord> {
        let key = self.conversation_key(conversation, epoch).ok()?;
        match decrypt(key, envelope) {
            Ok(record) => Some(record),
            Err(_) => {
                tracing::debug!("Dropping unreadable message in {:?}", conversation.id());
                None
            },
        }
    }

    /// Number of cached conversation keys.
    pub fn cached_keys(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn unlocked(byte: u8) -> Vault {
        let mut vault = Vault::new(MemoryEpochStore::default());
        vault.unlock_with_key(VaultKey::from_bytes([byte; 32]));
        vault
    }

    #[test]
    fn locked_vault_has_no_keys() {
        let mut vault = Vault::new(MemoryEpochStore::default());
        let direct = Conversation::Direct(vec![pid("a"), pid("b")]);

        assert_eq!(vault.conversation_key(&direct, None).unwrap_err(), ClientError::VaultLocked);
    }

    #[test]
    fn lock_clears_cache() {
        let mut vault = unlocked(1);
        let direct = Conversation::Direct(vec![pid("a"), pid("b")]);
        vault.conversation_key(&direct, None).unwrap();
        assert_eq!(vault.cached_keys(), 1);

        vault.lock();
        assert!(!vault.is_unlocked());
        assert_eq!(vault.cached_keys(), 0);
    }

    #[test]
    fn direct_key_ignores_participant_order() {
        let mut vault = unlocked(1);
        let ab = Conversation::Direct(vec![pid("a"), pid("b")]);
        let ba = Conversation::Direct(vec![pid("b"), pid("a")]);

        let first = *vault.conversation_key(&ab, None).unwrap().as_bytes();
        let second = *vault.conversation_key(&ba, None).unwrap().as_bytes();
        assert_eq!(first, second);
        assert_eq!(ab.id(), ba.id());
    }

    #[test]
    fn epochs_only_move_forward() {
        let mut vault = unlocked(1);
        let group = GroupId([9; 16]);
        let conversation = Conversation::Group(group);

        assert_eq!(vault.current_epoch(&conversation), Some(INITIAL_GROUP_EPOCH));
        assert_eq!(vault.advance_epoch(group), 2);
        vault.install_epoch(group, 5).unwrap();
        assert_eq!(vault.current_epoch(&conversation), Some(5));

        assert_eq!(
            vault.install_epoch(group, 3),
            Err(ClientError::StaleEpoch { requested: 3, current: 5 })
        );
    }

    #[test]
    fn distinct_epochs_get_distinct_keys() {
        let mut vault = unlocked(1);
        let conversation = Conversation::Group(GroupId([9; 16]));

        let one = *vault.conversation_key(&conversation, Some(1)).unwrap().as_bytes();
        let two = *vault.conversation_key(&conversation, Some(2)).unwrap().as_bytes();
        assert_ne!(one, two);
    }
}
