//! Vault behaviour across seal and open.

mod common;

use std::collections::HashSet;

use common::SimEnv;
use hush_client::{Conversation, MemoryEpochStore, Vault};
use hush_crypto::{KdfParams, PlaintextRecord, VaultKey};
use hush_proto::{GroupId, ParticipantId};
use proptest::prelude::*;

fn pid(s: &str) -> ParticipantId {
    ParticipantId::new(s).unwrap()
}

fn unlocked(byte: u8) -> Vault {
    let mut vault = Vault::new(MemoryEpochStore::default());
    vault.unlock_with_key(VaultKey::from_bytes([byte; 32]));
    vault
}

fn record(content: &str) -> PlaintextRecord {
    PlaintextRecord {
        sender_id: pid("alice"),
        sender_name: "Alice".into(),
        content: content.into(),
        timestamp: common::EPOCH_SECS,
        epoch: None,
    }
}

#[test]
fn nonces_never_repeat_under_one_key() {
    let env = SimEnv::with_seed(1);
    let mut vault = unlocked(1);
    let conversation = Conversation::Direct(vec![pid("alice"), pid("bob")]);

    let mut nonces = HashSet::new();
    for _ in 0..10_000 {
        let sealed = vault.seal(&env, &conversation, record("same text")).unwrap();
        assert!(nonces.insert(sealed.envelope.nonce), "nonce reused");
    }
}

#[test]
fn wrong_vault_key_opens_nothing() {
    let env = SimEnv::with_seed(2);
    let conversation = Conversation::Direct(vec![pid("alice"), pid("bob")]);

    let sealed = unlocked(1).seal(&env, &conversation, record("hello")).unwrap();

    assert!(unlocked(2).open(&conversation, &sealed.envelope, sealed.epoch).is_none());
    assert!(
        Vault::new(MemoryEpochStore::default())
            .open(&conversation, &sealed.envelope, sealed.epoch)
            .is_none()
    );
}

#[test]
fn other_conversation_opens_nothing() {
    let env = SimEnv::with_seed(3);
    let mut vault = unlocked(1);
    let ab = Conversation::Direct(vec![pid("alice"), pid("bob")]);
    let ac = Conversation::Direct(vec![pid("alice"), pid("carol")]);

    let sealed = vault.seal(&env, &ab, record("hello")).unwrap();
    assert!(vault.open(&ac, &sealed.envelope, sealed.epoch).is_none());
    assert_eq!(vault.open(&ab, &sealed.envelope, sealed.epoch), Some(record("hello")));
}

#[test]
fn group_history_stays_readable_across_epochs() {
    let env = SimEnv::with_seed(4);
    let mut vault = unlocked(1);
    let group = GroupId([5; 16]);
    let conversation = Conversation::Group(group);

    let old = vault.seal(&env, &conversation, record("before")).unwrap();
    assert_eq!(old.epoch, Some(1));

    vault.advance_epoch(group);
    let new = vault.seal(&env, &conversation, record("after")).unwrap();
    assert_eq!(new.epoch, Some(2));

    let opened = vault.open(&conversation, &old.envelope, old.epoch).unwrap();
    assert_eq!(opened.content, "before");
    assert_eq!(opened.epoch, Some(1));

    // Envelopes carry their epoch; the wrong one does not decrypt.
    assert!(vault.open(&conversation, &new.envelope, old.epoch).is_none());
}

#[tokio::test]
async fn unlock_is_deterministic_per_passphrase_and_salt() {
    let env = SimEnv::with_seed(5);
    let conversation = Conversation::Direct(vec![pid("alice"), pid("bob")]);

    let mut sender = Vault::new(MemoryEpochStore::default())
        .with_params(KdfParams::insecure_for_tests());
    sender.unlock("correct horse battery staple", b"relay-salt").await.unwrap();

    let mut reader = Vault::new(MemoryEpochStore::default())
        .with_params(KdfParams::insecure_for_tests());
    reader.unlock("correct horse battery staple", b"relay-salt").await.unwrap();

    let mut stranger = Vault::new(MemoryEpochStore::default())
        .with_params(KdfParams::insecure_for_tests());
    stranger.unlock("wrong horse battery staple", b"relay-salt").await.unwrap();

    let sealed = sender.seal(&env, &conversation, record("hi")).unwrap();
    assert_eq!(reader.open(&conversation, &sealed.envelope, None), Some(record("hi")));
    assert!(stranger.open(&conversation, &sealed.envelope, None).is_none());
}

#[tokio::test]
async fn short_salt_is_rejected() {
    let mut vault = Vault::new(MemoryEpochStore::default())
        .with_params(KdfParams::insecure_for_tests());

    assert!(vault.unlock("passphrase", b"short").await.is_err());
    assert!(!vault.is_unlocked());
}

#[test]
fn prop_any_record_round_trips_through_the_vault() {
    proptest!(|(content in ".{0,256}", name in "[a-zA-Z ]{1,32}", seed in any::<u64>())| {
        let env = SimEnv::with_seed(seed);
        let mut vault = unlocked(7);
        let conversation = Conversation::Direct(vec![pid("alice"), pid("bob")]);
        let original = PlaintextRecord { sender_name: name, ..record(&content) };

        let sealed = vault.seal(&env, &conversation, original.clone()).unwrap();
        prop_assert_eq!(vault.open(&conversation, &sealed.envelope, sealed.epoch), Some(original));
    });
}

#[test]
fn prop_tampering_is_detected() {
    proptest!(|(index in any::<prop::sample::Index>(), flip in 1u8..=255)| {
        let env = SimEnv::with_seed(9);
        let mut vault = unlocked(7);
        let conversation = Conversation::Direct(vec![pid("alice"), pid("bob")]);

        let mut sealed = vault.seal(&env, &conversation, record("tamper me")).unwrap();
        let at = index.index(sealed.envelope.ciphertext.len());
        sealed.envelope.ciphertext[at] ^= flip;

        prop_assert!(vault.open(&conversation, &sealed.envelope, sealed.epoch).is_none());
    });
}
