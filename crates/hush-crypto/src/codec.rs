//! Envelope encryption with ChaCha20-Poly1305.
//!
//! Nonces are supplied by the caller and must come from a cryptographically
//! secure source for every call. A counter is never acceptable: it would
//! repeat across restarts.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use hush_proto::{Envelope, ParticipantId, limits::NONCE_BYTES};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::{error::CryptoError, kdf::ConversationKey};

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// The structured message that gets encrypted into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaintextRecord {
    /// Author of the message
    pub sender_id: ParticipantId,
    /// Display name chosen by the author
    pub sender_name: String,
    /// Message body
    pub content: String,
    /// Author's wall-clock time, Unix seconds
    pub timestamp: u64,
    /// Group key epoch the record was sealed under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

/// Decryption failed.
///
/// Wrong key, tampered ciphertext and undecodable plaintext all produce this
/// same value. Callers drop the message or mark it unreadable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("message could not be decrypted")]
pub struct DecryptionFailure;

/// Serialize and seal a record.
///
/// # Errors
///
/// - `CryptoError::Encode` if the record cannot be serialized
pub fn encrypt(
    key: &ConversationKey,
    record: &PlaintextRecord,
    nonce: [u8; NONCE_BYTES],
) -> Result<Envelope, CryptoError> {
    let mut plaintext = Zeroizing::new(Vec::new());
    ciborium::ser::into_writer(record, &mut *plaintext)
        .map_err(|e| CryptoError::Encode(e.to_string()))?;

    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&nonce), plaintext.as_slice()) else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    Ok(Envelope { ciphertext, nonce })
}

/// Open an envelope.
///
/// # Errors
///
/// - [`DecryptionFailure`] for any failure, with no further detail
pub fn decrypt(
    key: &ConversationKey,
    envelope: &Envelope,
) -> Result<PlaintextRecord, DecryptionFailure> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| DecryptionFailure)?;

    ciborium::de::from_reader(plaintext.as_slice()).map_err(|_| DecryptionFailure)
}
