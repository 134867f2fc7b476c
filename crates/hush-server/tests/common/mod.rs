//! Shared fixtures for relay integration tests.
//!
//! `SimEnv` is a deterministic environment: time only moves when a test
//! advances it and randomness comes from a seeded ChaCha stream.

#![allow(dead_code)]

use std::{
    net::{IpAddr, Ipv4Addr},
    ops::Sub,
    sync::{Arc, Mutex},
    time::Duration,
};

use hush_core::Environment;
use hush_crypto::{TokenKey, knowledge_proof};
use hush_proto::{Frame, ParticipantId, Payload, payloads::session::Authenticate};
use hush_server::{
    AuthConfig, DEFAULT_TOKEN_TTL, DefenseConfig, RelayAction, RelayConfig, RelayDriver,
    RelayEvent, Storage,
};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const PASSPHRASE: &str = "correct horse battery staple";

/// Unix time at which every simulation starts.
pub const EPOCH_SECS: u64 = 1_700_000_000;

/// Point on the simulated monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SimInstant(Duration);

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
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

pub fn addr(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
}

pub fn relay_config(defense: DefenseConfig) -> RelayConfig {
    let auth = AuthConfig {
        proof_hash: knowledge_proof(PASSPHRASE),
        kdf_salt: b"relay-salt".to_vec(),
        token_ttl: DEFAULT_TOKEN_TTL,
    };
    RelayConfig { defense, ..RelayConfig::new(auth) }
}

pub fn driver<S: Storage>(
    env: &SimEnv,
    storage: S,
    defense: DefenseConfig,
) -> RelayDriver<SimEnv, S> {
    RelayDriver::new(env.clone(), storage, relay_config(defense), TokenKey::from_bytes([42; 32]))
}

pub fn frame(payload: Payload) -> Frame {
    payload.into_frame().unwrap()
}

pub fn send<S: Storage>(
    driver: &mut RelayDriver<SimEnv, S>,
    session_id: u64,
    payload: Payload,
) -> Vec<RelayAction> {
    driver.process_event(RelayEvent::FrameReceived { session_id, frame: frame(payload) }).unwrap()
}

/// Payloads of every frame sent to `session_id`, in order.
pub fn replies_to(actions: &[RelayAction], target: u64) -> Vec<Payload> {
    actions
        .iter()
        .filter_map(|action| match action {
            RelayAction::SendToSession { session_id, frame } if *session_id == target => {
                Some(Payload::from_frame(frame).unwrap())
            },
            RelayAction::Deliver { session_ids, frame } if session_ids.contains(&target) => {
                Some(Payload::from_frame(frame).unwrap())
            },
            _ => None,
        })
        .collect()
}

pub fn authenticate_request(passphrase: &str, participant: &str) -> Payload {
    Payload::Authenticate(Authenticate {
        proof: knowledge_proof(passphrase).to_vec(),
        participant_id: ParticipantId::new(participant).unwrap(),
    })
}

/// Connect `session_id` from `from` and run the full handshake as
/// `participant`.
pub fn login<S: Storage>(
    driver: &mut RelayDriver<SimEnv, S>,
    session_id: u64,
    from: IpAddr,
    participant: &str,
) {
    driver
        .process_event(RelayEvent::ConnectionAccepted { session_id, remote_addr: from })
        .unwrap();

    let actions = send(driver, session_id, authenticate_request(PASSPHRASE, participant));
    let Some(Payload::AuthGranted(granted)) = replies_to(&actions, session_id).pop() else {
        panic!("authentication failed for {participant}");
    };

    let actions = send(
        driver,
        session_id,
        Payload::Hello(hush_proto::payloads::session::Hello { token: granted.token }),
    );
    assert!(
        matches!(replies_to(&actions, session_id).first(), Some(Payload::HelloReply(_))),
        "hello rejected for {participant}"
    );
}
