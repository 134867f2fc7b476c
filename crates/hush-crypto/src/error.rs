//! Crypto error types

use thiserror::Error;

/// Errors from key derivation and token handling.
///
/// Decryption has its own opaque [`crate::DecryptionFailure`] and never
/// produces one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// KDF salt shorter than Argon2 accepts
    #[error("kdf salt must be at least {min} bytes, got {actual}")]
    SaltTooShort {
        /// Minimum accepted length
        min: usize,
        /// Supplied length
        actual: usize,
    },

    /// Argon2 rejected the parameters or failed
    #[error("argon2: {0}")]
    Kdf(String),

    /// Record could not be serialized before encryption
    #[error("failed to encode plaintext record: {0}")]
    Encode(String),

    /// Token is malformed, forged or expired
    #[error("invalid session token")]
    InvalidToken,
}
