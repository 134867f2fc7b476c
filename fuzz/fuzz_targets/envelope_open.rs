//! Fuzz target for envelope decryption.
//!
//! Arbitrary ciphertexts and nonces must be rejected with
//! `DecryptionFailure`, never a panic, and nothing forged may open.

#![no_main]

use arbitrary::Arbitrary;
use hush_crypto::{ConversationKey, decrypt};
use hush_proto::Envelope;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    key: [u8; 32],
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let key = ConversationKey::from_bytes(input.key);
    let envelope = Envelope { ciphertext: input.ciphertext, nonce: input.nonce };

    assert!(decrypt(&key, &envelope).is_err(), "forged envelope opened");
});
