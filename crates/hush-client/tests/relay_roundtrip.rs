//! Client sessions talking to an in-process relay.
//!
//! Frames move synchronously between the Sans-IO client and the Sans-IO
//! relay driver, so whole conversations run deterministically.

mod common;

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr},
};

use common::{PASSPHRASE, SALT, Session, SimEnv, session_as};
use hush_client::{
    ClientAction, ClientEvent, Conversation, MemoryBlobStore, MemoryEpochStore, Vault,
};
use hush_crypto::{KdfParams, PlaintextRecord, TokenKey, derive_vault_key, knowledge_proof};
use hush_proto::{CorrelationId, Frame, ParticipantId, payloads::relay::OutboundMessage};
use hush_server::{
    AuthConfig, DEFAULT_TOKEN_TTL, MemoryStorage, RelayAction, RelayConfig, RelayDriver,
    RelayEvent,
};

struct Network {
    relay: RelayDriver<SimEnv, MemoryStorage>,
    inbox: HashMap<u64, Vec<Frame>>,
}

impl Network {
    fn new(env: &SimEnv) -> Self {
        let auth = AuthConfig {
            proof_hash: knowledge_proof(PASSPHRASE),
            kdf_salt: SALT.to_vec(),
            token_ttl: DEFAULT_TOKEN_TTL,
        };
        let relay = RelayDriver::new(
            env.clone(),
            MemoryStorage::new(),
            RelayConfig::new(auth),
            TokenKey::from_bytes([42; 32]),
        );
        Self { relay, inbox: HashMap::new() }
    }

    /// Feed `event` into `client` and run the exchange until neither side
    /// has anything left for it. Returns the actions meant for the
    /// application.
    fn run(
        &mut self,
        client: &mut Session,
        session_id: u64,
        event: ClientEvent<common::SimInstant>,
    ) -> Vec<ClientAction> {
        let pending = client.handle(event).unwrap().into();
        self.settle(client, session_id, pending)
    }

    /// Hand `client` whatever the relay fanned out to it meanwhile.
    fn deliver(&mut self, client: &mut Session, session_id: u64) -> Vec<ClientAction> {
        self.settle(client, session_id, VecDeque::new())
    }

    fn settle(
        &mut self,
        client: &mut Session,
        session_id: u64,
        mut pending: VecDeque<ClientAction>,
    ) -> Vec<ClientAction> {
        let mut surfaced = Vec::new();

        loop {
            let Some(action) = pending.pop_front() else {
                let frames = self.inbox.remove(&session_id).unwrap_or_default();
                if frames.is_empty() {
                    return surfaced;
                }
                for frame in frames {
                    pending.extend(client.handle(ClientEvent::FrameReceived(frame)).unwrap());
                }
                continue;
            };

            match action {
                ClientAction::Dial => {
                    let remote_addr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
                    let accepted = RelayEvent::ConnectionAccepted { session_id, remote_addr };
                    self.relay.process_event(accepted).unwrap();
                    pending.extend(client.handle(ClientEvent::TransportConnected).unwrap());
                },
                ClientAction::Send(frame) => {
                    let event = RelayEvent::FrameReceived { session_id, frame };
                    let actions = self.relay.process_event(event).unwrap();
                    self.route(actions);
                },
                ClientAction::Hangup => {
                    let closed =
                        RelayEvent::ConnectionClosed { session_id, reason: "hangup".into() };
                    self.relay.process_event(closed).unwrap();
                    surfaced.push(ClientAction::Hangup);
                },
                other => surfaced.push(other),
            }
        }
    }

    fn route(&mut self, actions: Vec<RelayAction>) {
        for action in actions {
            match action {
                RelayAction::SendToSession { session_id, frame } => {
                    self.inbox.entry(session_id).or_default().push(frame);
                },
                RelayAction::Deliver { session_ids, frame } => {
                    for session_id in session_ids {
                        self.inbox.entry(session_id).or_default().push(frame.clone());
                    }
                },
                _ => {},
            }
        }
    }
}

fn pid(s: &str) -> ParticipantId {
    ParticipantId::new(s).unwrap()
}

fn vault() -> Vault {
    let key = derive_vault_key(PASSPHRASE, SALT, KdfParams::insecure_for_tests()).unwrap();
    let mut vault = Vault::new(MemoryEpochStore::default());
    vault.unlock_with_key(key);
    vault
}

fn compose(
    env: &SimEnv,
    vault: &mut Vault,
    conversation: &Conversation,
    content: &str,
) -> OutboundMessage {
    let record = PlaintextRecord {
        sender_id: pid("alice"),
        sender_name: "Alice".into(),
        content: content.into(),
        timestamp: common::EPOCH_SECS,
        epoch: None,
    };
    let sealed = vault.seal(env, conversation, record).unwrap();
    OutboundMessage {
        conversation_id: sealed.conversation_id,
        envelope: sealed.envelope,
        correlation_id: CorrelationId(hush_client::Environment::random_id(env)),
        epoch: sealed.epoch,
        recipients: Vec::new(),
    }
}

fn is_ready(actions: &[ClientAction]) -> bool {
    actions.iter().any(|a| matches!(a, ClientAction::Ready { .. }))
}

#[test]
fn offline_sends_reach_subscribers_in_order() {
    let env = SimEnv::with_seed(1);
    let mut net = Network::new(&env);
    let conversation = Conversation::Direct(vec![pid("alice"), pid("bob")]);
    let room = conversation.id();

    let mut bob = session_as(&env, MemoryBlobStore::new(), pid("bob"));
    net.run(&mut bob, 2, ClientEvent::Subscribe { conversation_id: room });
    assert!(is_ready(&net.run(&mut bob, 2, ClientEvent::Connect)));

    // Composed while alice is offline.
    let mut alice = session_as(&env, MemoryBlobStore::new(), pid("alice"));
    let mut alice_vault = vault();
    for text in ["first", "second", "third"] {
        let message = compose(&env, &mut alice_vault, &conversation, text);
        assert!(net.run(&mut alice, 1, ClientEvent::Send(message)).is_empty());
    }
    assert_eq!(alice.queue().len(), 3);

    let actions = net.run(&mut alice, 1, ClientEvent::Connect);
    assert!(is_ready(&actions));
    let delivered: Vec<u64> = actions
        .iter()
        .filter_map(|a| match a {
            ClientAction::Delivered(d) => Some(d.id.0),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), 3);
    assert!(delivered.windows(2).all(|w| w[0] < w[1]));
    assert!(alice.queue().is_empty());

    let mut bob_vault = vault();
    let received: Vec<String> = net
        .deliver(&mut bob, 2)
        .into_iter()
        .filter_map(|a| match a {
            ClientAction::Message(m) => bob_vault.open(&conversation, &m.envelope, m.epoch),
            _ => None,
        })
        .map(|record| record.content)
        .collect();
    assert_eq!(received, vec!["first", "second", "third"]);
}

#[test]
fn history_catches_up_a_late_reader() {
    let env = SimEnv::with_seed(2);
    let mut net = Network::new(&env);
    let conversation = Conversation::Direct(vec![pid("alice"), pid("bob")]);

    let mut alice = session_as(&env, MemoryBlobStore::new(), pid("alice"));
    let mut alice_vault = vault();
    net.run(&mut alice, 1, ClientEvent::Connect);
    for text in ["one", "two"] {
        let message = compose(&env, &mut alice_vault, &conversation, text);
        net.run(&mut alice, 1, ClientEvent::Send(message));
    }

    let mut bob = session_as(&env, MemoryBlobStore::new(), pid("bob"));
    net.run(&mut bob, 2, ClientEvent::Connect);
    let request = ClientEvent::FetchHistory {
        conversation_id: conversation.id(),
        after: None,
        limit: 50,
    };
    let actions = net.run(&mut bob, 2, request);

    let Some(ClientAction::History(page)) = actions.into_iter().next() else {
        panic!("no history page");
    };
    assert!(!page.has_more);

    let mut bob_vault = vault();
    let texts: Vec<String> = page
        .messages
        .iter()
        .filter_map(|m| bob_vault.open(&conversation, &m.envelope, m.epoch))
        .map(|record| record.content)
        .collect();
    assert_eq!(texts, vec!["one", "two"]);
}

#[test]
fn wrong_passphrase_is_refused_and_not_retried() {
    let env = SimEnv::with_seed(3);
    let mut net = Network::new(&env);

    let queue = hush_client::OfflineDeliveryQueue::open(MemoryBlobStore::new()).unwrap();
    let mut mallory = hush_client::ClientSession::new(
        env.clone(),
        hush_client::SessionConfig::default(),
        pid("mallory"),
        "not the passphrase",
        queue,
    );

    let actions = net.run(&mut mallory, 3, ClientEvent::Connect);
    assert!(actions.iter().any(|a| matches!(a, ClientAction::AuthFailed { .. })));
    assert!(!actions.iter().any(|a| matches!(a, ClientAction::WakeAfter { .. })));
    assert_eq!(mallory.reconnect_state(), hush_client::ReconnectState::Disconnected);
}
