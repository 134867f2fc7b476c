//! HUSH cryptographic core
//!
//! Everything that touches plaintext or key material lives here. The relay
//! and the storage layers only ever see the envelopes and identifiers this
//! crate produces.
//!
//! # Key hierarchy
//!
//! ```text
//! shared passphrase
//!        │ normalize (lowercase, trim, collapse whitespace)
//!        ├──────────────► SHA-256 ─► knowledge proof (sent to relay)
//!        ▼
//! Argon2id(salt, KdfParams::V1) ─► VaultKey (memory only)
//!        │
//!        ▼
//! HKDF-SHA256(context = sorted participants | group id, epoch)
//!        │
//!        ▼
//! ConversationKey ─► ChaCha20-Poly1305(random 96-bit nonce) ─► Envelope
//! ```
//!
//! Derivation never fails on a wrong passphrase or participant set: it just
//! produces a different key. Wrongness surfaces only as a
//! [`DecryptionFailure`], which carries no detail about its cause.
//!
//! All functions are pure. Nonces and random material are supplied by the
//! caller so that tests and simulations stay deterministic.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod codec;
mod error;
mod identity;
mod kdf;
mod token;

pub use codec::{DecryptionFailure, PlaintextRecord, TAG_SIZE, decrypt, encrypt};
pub use error::CryptoError;
pub use identity::{compute_conversation_id, group_conversation_id};
pub use kdf::{
    ConversationKey, DIRECT_EPOCH, KdfParams, VaultKey, derive_conversation_key,
    derive_group_key, derive_vault_key, knowledge_proof, normalize_passphrase,
};
pub use token::{SessionClaims, TokenKey, constant_time_eq};
