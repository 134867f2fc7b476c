//! Shared fixtures for client integration tests.

#![allow(dead_code)]

use std::{
    ops::{Add, Sub},
    sync::{Arc, Mutex},
    time::Duration,
};

use hush_client::{
    ClientAction, ClientEvent, ClientSession, Environment, MemoryBlobStore, OfflineDeliveryQueue,
    SessionConfig,
};
use hush_proto::{
    ConversationId, CorrelationId, Envelope, Frame, ParticipantId, Payload,
    payloads::{
        relay::{ConversationRef, MessageAck, OutboundMessage, SelfSubscribed},
        session::{AuthGranted, HelloReply},
    },
};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const PASSPHRASE: &str = "correct horse battery staple";

/// Unix time at which every simulation starts.
pub const EPOCH_SECS: u64 = 1_700_000_000;

pub const SALT: &[u8] = b"relay-salt";

/// Point on the simulated monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SimInstant(Duration);

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for SimInstant {
    type Output = SimInstant;

    fn add(self, rhs: Duration) -> SimInstant {
        SimInstant(self.0 + rhs)
    }
}

struct SimState {
    elapsed: Duration,
    rng: ChaCha8Rng,
}

/// Deterministic environment with scripted time.
#[derive(Clone)]
pub struct SimEnv {
    state: Arc<Mutex<SimState>>,
}

impl SimEnv {
    pub fn with_seed(seed: u64) -> Self {
        let state = SimState { elapsed: Duration::ZERO, rng: ChaCha8Rng::seed_from_u64(seed) };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn advance(&self, by: Duration) {
        self.state.lock().unwrap().elapsed += by;
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.state.lock().unwrap().elapsed)
    }

    fn unix_time(&self) -> u64 {
        EPOCH_SECS + self.state.lock().unwrap().elapsed.as_secs()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.state.lock().unwrap().rng.fill_bytes(buffer);
    }
}

pub type Session = ClientSession<SimEnv, MemoryBlobStore>;

pub fn alice() -> ParticipantId {
    ParticipantId::new("alice").unwrap()
}

pub fn session(env: &SimEnv, store: MemoryBlobStore) -> Session {
    session_as(env, store, alice())
}

pub fn session_as(env: &SimEnv, store: MemoryBlobStore, participant: ParticipantId) -> Session {
    let queue = OfflineDeliveryQueue::open(store).unwrap();
    ClientSession::new(env.clone(), SessionConfig::default(), participant, PASSPHRASE, queue)
}

pub fn frame(payload: Payload) -> Frame {
    payload.into_frame().unwrap()
}

/// Feed a relay payload into the session.
pub fn receive(session: &mut Session, payload: Payload) -> Vec<ClientAction> {
    session.handle(ClientEvent::FrameReceived(frame(payload))).unwrap()
}

/// Payloads of every frame the session asked to send, in order.
pub fn sent(actions: &[ClientAction]) -> Vec<Payload> {
    actions
        .iter()
        .filter_map(|action| match action {
            ClientAction::Send(frame) => Some(Payload::from_frame(frame).unwrap()),
            _ => None,
        })
        .collect()
}

pub fn granted(expires_at: u64) -> Payload {
    Payload::AuthGranted(AuthGranted {
        token: "token-1".into(),
        kdf_salt: SALT.to_vec(),
        expires_at,
    })
}

pub fn hello_reply(session_id: u64) -> Payload {
    Payload::HelloReply(HelloReply {
        session_id,
        participant_id: alice(),
        heartbeat_interval_secs: 30,
    })
}

pub fn subscribed(conversation_id: ConversationId) -> Payload {
    Payload::Subscribed(ConversationRef { conversation_id })
}

pub fn self_subscribed() -> Payload {
    Payload::SelfSubscribed(SelfSubscribed { participant_id: alice() })
}

pub fn ack(correlation: u8, id: u64) -> Payload {
    Payload::Ack(MessageAck {
        correlation_id: CorrelationId([correlation; 16]),
        id: hush_proto::MessageId(id),
        created_at: EPOCH_SECS,
    })
}

pub fn outbound(conversation_id: ConversationId, correlation: u8) -> OutboundMessage {
    OutboundMessage {
        conversation_id,
        envelope: Envelope { ciphertext: vec![correlation; 40], nonce: [correlation; 12] },
        correlation_id: CorrelationId([correlation; 16]),
        epoch: None,
        recipients: Vec::new(),
    }
}

/// Connect and authenticate without subscriptions, ending `Ready`.
pub fn bring_online(session: &mut Session, session_id: u64) -> Vec<ClientAction> {
    assert_eq!(session.handle(ClientEvent::Connect).unwrap(), vec![ClientAction::Dial]);
    session.handle(ClientEvent::TransportConnected).unwrap();
    receive(session, granted(EPOCH_SECS + 3_600));
    receive(session, hello_reply(session_id))
}
