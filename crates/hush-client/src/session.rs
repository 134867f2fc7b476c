//! Client session state machine.
//!
//! Drives one logical relay session across any number of transports:
//!
//! ```text
//! Offline ─TransportConnected─> Authenticating ─AuthGranted─> Greeting
//!    ^                             (skipped with a live token)   │
//!    │                                                           │ HelloReply
//!    │  drop / timeout / logout                                  ▼
//!    └─────────── Ready <─all confirmations─ Resubscribing ──────┘
//! ```
//!
//! The reconnect machine only sees the session as connected once it is
//! `Ready`, so a drop during the handshake counts as a failed dial and backs
//! off like one.
//!
//! Every send is recorded in the [`OfflineDeliveryQueue`] first. Entries are
//! transmitted whenever the session becomes ready (or on
//! [`ClientEvent::Resync`]) and leave the queue only on the relay's ack.

use std::{
    collections::{BTreeSet, HashMap},
    ops::Add,
    time::Duration,
};

use hush_core::{Environment, ReconnectAction, ReconnectConfig, ReconnectMachine, ReconnectState};
use hush_crypto::knowledge_proof;
use hush_proto::{
    ConversationId, CorrelationId, ErrorPayload, Frame, MessageId, ParticipantId, Payload,
    payloads::{
        relay::{ConversationRef, HistoryRequest, MessageAck},
        session::{AuthGranted, Authenticate, Goodbye, Hello, HelloReply},
    },
};
use zeroize::Zeroizing;

use crate::{
    error::ClientError,
    event::{ClientAction, ClientEvent},
    queue::{FailureOutcome, OfflineDeliveryQueue},
    store::BlobStore,
};

/// Time allowed for an ack before the send counts as failed.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed from transport up to `Ready`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Tokens this close to expiry are not reused.
const TOKEN_REFRESH_MARGIN: u64 = 60;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backoff schedule for reconnects
    pub reconnect: ReconnectConfig,
    /// Ack deadline per send
    pub ack_timeout: Duration,
    /// Deadline for authentication, hello and resubscription
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Coarse session state for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport
    Offline,
    /// Authenticating or opening the relay session
    Handshaking,
    /// Restoring subscriptions
    Resubscribing,
    /// Sends go out immediately
    Ready,
}

#[derive(Debug, Clone)]
enum Phase<I> {
    Offline,
    Authenticating { since: I },
    Greeting { since: I },
    Resubscribing { since: I, awaiting: BTreeSet<ConversationId>, awaiting_self: bool },
    Ready,
}

struct SessionToken {
    token: Zeroizing<String>,
    expires_at: u64,
}

/// Sans-IO client session.
pub struct ClientSession<E: Environment, S: BlobStore> {
    env: E,
    config: SessionConfig,
    participant_id: ParticipantId,
    proof: Zeroizing<[u8; 32]>,
    reconnect: ReconnectMachine<E::Instant>,
    phase: Phase<E::Instant>,
    token: Option<SessionToken>,
    session_id: Option<u64>,
    subscriptions: BTreeSet<ConversationId>,
    self_subscribed: bool,
    queue: OfflineDeliveryQueue<S>,
    in_flight: HashMap<CorrelationId, E::Instant>,
}

impl<E, S> ClientSession<E, S>
where
    E: Environment,
    E::Instant: Add<Duration, Output = E::Instant>,
    S: BlobStore,
{
    /// Create an offline session for `participant_id`.
    ///
    /// Only the knowledge proof of `passphrase` is kept.
    pub fn new(
        env: E,
        config: SessionConfig,
        participant_id: ParticipantId,
        passphrase: &str,
        queue: OfflineDeliveryQueue<S>,
    ) -> Self {
        Self {
            env,
            reconnect: ReconnectMachine::new(config.reconnect.clone()),
            config,
            participant_id,
            proof: Zeroizing::new(knowledge_proof(passphrase)),
            phase: Phase::Offline,
            token: None,
            session_id: None,
            subscriptions: BTreeSet::new(),
            self_subscribed: false,
            queue,
            in_flight: HashMap::new(),
        }
    }

    /// Participant this session authenticates as.
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Offline => SessionState::Offline,
            Phase::Authenticating { .. } | Phase::Greeting { .. } => SessionState::Handshaking,
            Phase::Resubscribing { .. } => SessionState::Resubscribing,
            Phase::Ready => SessionState::Ready,
        }
    }

    /// Whether sends go out immediately.
    pub fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready)
    }

    /// Reconnect machine state.
    pub fn reconnect_state(&self) -> ReconnectState<E::Instant> {
        self.reconnect.state()
    }

    /// Relay session id while connected.
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Conversations restored on every reconnect.
    pub fn subscriptions(&self) -> impl Iterator<Item = &ConversationId> {
        self.subscriptions.iter()
    }

    /// Envelopes awaiting acknowledgement.
    pub fn queue(&self) -> &OfflineDeliveryQueue<S> {
        &self.queue
    }

    /// Number of sends awaiting an ack on the current transport.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Process an event and return resulting actions.
    pub fn handle(
        &mut self,
        event: ClientEvent<E::Instant>,
    ) -> Result<Vec<ClientAction>, ClientError> {
        match event {
            ClientEvent::Connect => Ok(reconnect_actions(self.reconnect.connect())),
            ClientEvent::TransportConnected => self.handle_transport_connected(),
            ClientEvent::TransportFailed => {
                self.go_offline();
                let now = self.env.now();
                Ok(reconnect_actions(self.reconnect.on_connect_failed(now)))
            },
            ClientEvent::TransportClosed { reason } => self.handle_transport_closed(&reason),
            ClientEvent::FrameReceived(frame) => self.handle_frame(&frame),
            ClientEvent::Tick { now } => self.handle_tick(now),
            ClientEvent::Subscribe { conversation_id } => self.handle_subscribe(conversation_id),
            ClientEvent::Unsubscribe { conversation_id } => {
                self.handle_unsubscribe(conversation_id)
            },
            ClientEvent::SubscribeSelf => self.handle_subscribe_self(),
            ClientEvent::Send(message) => {
                self.queue.enqueue_message(message)?;
                self.flush()
            },
            ClientEvent::FetchHistory { conversation_id, after, limit } => {
                self.handle_fetch_history(conversation_id, after, limit)
            },
            ClientEvent::Resync => self.flush(),
            ClientEvent::Logout => self.handle_logout(),
        }
    }

    fn handle_transport_connected(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        if !matches!(self.reconnect.state(), ReconnectState::Connecting { .. }) {
            // Logged out while the dial was in flight.
            return Ok(vec![ClientAction::Hangup]);
        }

        let since = self.env.now();
        let now_secs = self.env.unix_time();
        let token = self
            .token
            .as_ref()
            .filter(|t| t.expires_at > now_secs.saturating_add(TOKEN_REFRESH_MARGIN))
            .map(|t| t.token.as_str().to_owned());

        if let Some(token) = token {
            self.phase = Phase::Greeting { since };
            return Ok(vec![send(Payload::Hello(Hello { token }))?]);
        }

        self.phase = Phase::Authenticating { since };
        let request = Authenticate {
            proof: self.proof.to_vec(),
            participant_id: self.participant_id.clone(),
        };
        Ok(vec![send(Payload::Authenticate(request))?])
    }

    fn handle_transport_closed(
        &mut self,
        reason: &str,
    ) -> Result<Vec<ClientAction>, ClientError> {
        let mut actions =
            vec![ClientAction::Log { message: format!("Transport closed: {reason}") }];

        let lost: Vec<CorrelationId> = self.in_flight.drain().map(|(id, _)| id).collect();
        for local_id in lost {
            actions.extend(self.record_failure(local_id)?);
        }

        self.go_offline();
        let now = self.env.now();
        let reconnect = if self.reconnect.state() == ReconnectState::Connected {
            self.reconnect.on_disconnected(now)
        } else {
            self.reconnect.on_connect_failed(now)
        };
        actions.extend(reconnect_actions(reconnect));

        Ok(actions)
    }

    fn handle_frame(&mut self, frame: &Frame) -> Result<Vec<ClientAction>, ClientError> {
        match Payload::from_frame(frame)? {
            Payload::AuthGranted(granted) => self.handle_auth_granted(granted),
            Payload::AuthDenied(denied) => {
                self.token = None;
                self.go_offline();
                let mut actions = vec![ClientAction::AuthFailed { reason: denied.reason }];
                actions.extend(reconnect_actions(self.reconnect.logout()));
                Ok(actions)
            },
            Payload::HelloReply(reply) => self.handle_hello_reply(&reply),
            Payload::Subscribed(confirmed) => Ok(self.confirm(Some(confirmed.conversation_id))),
            Payload::SelfSubscribed(_) => Ok(self.confirm(None)),
            Payload::Unsubscribed(_) | Payload::Pong => Ok(Vec::new()),
            Payload::Heartbeat => Ok(vec![send(Payload::Ping)?]),
            Payload::Message(message) => Ok(vec![ClientAction::Message(message)]),
            Payload::Ack(ack) => self.handle_ack(&ack),
            Payload::HistoryPage(page) => Ok(vec![ClientAction::History(page)]),
            Payload::Expired(expired) => Ok(vec![ClientAction::Expired(expired)]),
            Payload::Error(error) => self.handle_error(error),
            Payload::Goodbye(goodbye) => Ok(vec![ClientAction::Log {
                message: format!("Relay closed the session: {}", goodbye.reason),
            }]),
            other => Ok(vec![ClientAction::Log {
                message: format!("Ignoring unexpected {:?} frame", other.opcode()),
            }]),
        }
    }

    fn handle_auth_granted(
        &mut self,
        granted: AuthGranted,
    ) -> Result<Vec<ClientAction>, ClientError> {
        let Phase::Authenticating { since } = self.phase else {
            return Ok(vec![ClientAction::Log { message: "Unsolicited auth grant".into() }]);
        };

        self.phase = Phase::Greeting { since };
        let hello = send(Payload::Hello(Hello { token: granted.token.clone() }))?;
        self.token = Some(SessionToken {
            token: Zeroizing::new(granted.token),
            expires_at: granted.expires_at,
        });

        let authenticated = ClientAction::Authenticated {
            kdf_salt: granted.kdf_salt,
            expires_at: granted.expires_at,
        };
        Ok(vec![authenticated, hello])
    }

    fn handle_hello_reply(
        &mut self,
        reply: &HelloReply,
    ) -> Result<Vec<ClientAction>, ClientError> {
        let Phase::Greeting { since } = self.phase else {
            return Ok(vec![ClientAction::Log { message: "Unsolicited hello reply".into() }]);
        };
        self.session_id = Some(reply.session_id);

        let mut actions = Vec::with_capacity(self.subscriptions.len() + 1);
        for conversation_id in &self.subscriptions {
            actions.push(send(Payload::Subscribe(ConversationRef {
                conversation_id: *conversation_id,
            }))?);
        }
        if self.self_subscribed {
            actions.push(send(Payload::SubscribeSelf)?);
        }

        self.phase = Phase::Resubscribing {
            since,
            awaiting: self.subscriptions.clone(),
            awaiting_self: self.self_subscribed,
        };
        actions.extend(self.try_become_ready()?);

        Ok(actions)
    }

    /// Mark a subscription confirmed. `None` is the self channel.
    fn confirm(&mut self, conversation_id: Option<ConversationId>) -> Vec<ClientAction> {
        if let Phase::Resubscribing { awaiting, awaiting_self, .. } = &mut self.phase {
            match conversation_id {
                Some(id) => {
                    awaiting.remove(&id);
                },
                None => *awaiting_self = false,
            }
        }

        match self.try_become_ready() {
            Ok(actions) => actions,
            Err(e) => vec![ClientAction::Log { message: format!("Failed to flush queue: {e}") }],
        }
    }

    fn try_become_ready(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        let Phase::Resubscribing { awaiting, awaiting_self, .. } = &self.phase else {
            return Ok(Vec::new());
        };
        if !awaiting.is_empty() || *awaiting_self {
            return Ok(Vec::new());
        }

        let connected = self.reconnect.on_connected();
        if connected.contains(&ReconnectAction::Hangup) {
            self.go_offline();
            return Ok(vec![ClientAction::Hangup]);
        }

        self.phase = Phase::Ready;
        let mut actions = vec![ClientAction::Ready { session_id: self.session_id.unwrap_or(0) }];
        actions.extend(self.flush()?);
        Ok(actions)
    }

    fn handle_ack(&mut self, ack: &MessageAck) -> Result<Vec<ClientAction>, ClientError> {
        self.in_flight.remove(&ack.correlation_id);
        Ok(self.queue.acknowledge(ack)?.map(ClientAction::Delivered).into_iter().collect())
    }

    fn handle_error(&mut self, error: ErrorPayload) -> Result<Vec<ClientAction>, ClientError> {
        let mut actions = vec![ClientAction::Log {
            message: format!("Relay error {}: {}", error.code, error.message),
        }];

        if let Some(local_id) = error.correlation_id {
            self.in_flight.remove(&local_id);
            // Throttled sends stay queued without spending an attempt.
            if error.code != ErrorPayload::RATE_LIMITED {
                actions.extend(self.record_failure(local_id)?);
            }
            return Ok(actions);
        }

        match &mut self.phase {
            // Token refused; the relay closes and the next dial authenticates
            // from scratch.
            Phase::Greeting { .. } => self.token = None,
            // A refused subscription is not worth holding the session for.
            Phase::Resubscribing { awaiting, awaiting_self, .. } => {
                awaiting.clear();
                *awaiting_self = false;
                actions.extend(self.try_become_ready()?);
            },
            _ => {},
        }

        Ok(actions)
    }

    fn handle_tick(&mut self, now: E::Instant) -> Result<Vec<ClientAction>, ClientError> {
        let mut actions = reconnect_actions(self.reconnect.tick(now));

        let handshake_started = match &self.phase {
            Phase::Authenticating { since }
            | Phase::Greeting { since }
            | Phase::Resubscribing { since, .. } => Some(*since),
            Phase::Offline | Phase::Ready => None,
        };
        if let Some(since) = handshake_started
            && now - since >= self.config.handshake_timeout
        {
            self.go_offline();
            actions.push(ClientAction::Log { message: "Handshake timed out".into() });
            actions.push(ClientAction::Hangup);
            actions.extend(reconnect_actions(self.reconnect.on_connect_failed(now)));
            return Ok(actions);
        }

        let timeout = self.config.ack_timeout;
        let mut expired: Vec<CorrelationId> = self
            .in_flight
            .iter()
            .filter(|(_, sent_at)| now - **sent_at >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for local_id in expired {
            self.in_flight.remove(&local_id);
            actions.extend(self.record_failure(local_id)?);
        }

        // Retries go out without waiting for the next send or resync.
        actions.extend(self.flush()?);
        Ok(actions)
    }

    fn handle_subscribe(
        &mut self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ClientAction>, ClientError> {
        if !self.subscriptions.insert(conversation_id) {
            return Ok(Vec::new());
        }

        match &mut self.phase {
            Phase::Ready => {},
            Phase::Resubscribing { awaiting, .. } => {
                awaiting.insert(conversation_id);
            },
            // Sent with the rest once the session reaches resubscription.
            _ => return Ok(Vec::new()),
        }
        Ok(vec![send(Payload::Subscribe(ConversationRef { conversation_id }))?])
    }

    fn handle_unsubscribe(
        &mut self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ClientAction>, ClientError> {
        if !self.subscriptions.remove(&conversation_id) {
            return Ok(Vec::new());
        }

        match &mut self.phase {
            Phase::Ready => {},
            Phase::Resubscribing { awaiting, .. } => {
                awaiting.remove(&conversation_id);
            },
            _ => return Ok(Vec::new()),
        }

        let mut actions = vec![send(Payload::Unsubscribe(ConversationRef { conversation_id }))?];
        actions.extend(self.try_become_ready()?);
        Ok(actions)
    }

    fn handle_subscribe_self(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        if std::mem::replace(&mut self.self_subscribed, true) {
            return Ok(Vec::new());
        }

        match &mut self.phase {
            Phase::Ready => {},
            Phase::Resubscribing { awaiting_self, .. } => *awaiting_self = true,
            _ => return Ok(Vec::new()),
        }
        Ok(vec![send(Payload::SubscribeSelf)?])
    }

    fn handle_fetch_history(
        &mut self,
        conversation_id: ConversationId,
        after: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<ClientAction>, ClientError> {
        if !self.is_ready() {
            return Err(ClientError::NotConnected);
        }
        Ok(vec![send(Payload::History(HistoryRequest { conversation_id, after, limit }))?])
    }

    fn handle_logout(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        let mut actions = Vec::new();
        if !matches!(self.phase, Phase::Offline) {
            actions.push(send(Payload::Goodbye(Goodbye { reason: "logout".into() }))?);
        }

        // Queued entries stay for the next login; logging out is not a
        // delivery failure.
        self.in_flight.clear();
        self.token = None;
        self.go_offline();
        actions.extend(reconnect_actions(self.reconnect.logout()));

        Ok(actions)
    }

    /// Transmit every queued entry that is not already in flight.
    fn flush(&mut self) -> Result<Vec<ClientAction>, ClientError> {
        if !self.is_ready() {
            return Ok(Vec::new());
        }

        let now = self.env.now();
        let mut actions = Vec::new();
        let outbound: Vec<_> = self
            .queue
            .iter()
            .filter(|entry| !self.in_flight.contains_key(&entry.local_id))
            .map(|entry| entry.to_outbound())
            .collect();

        for message in outbound {
            self.in_flight.insert(message.correlation_id, now);
            actions.push(send(Payload::SendMessage(message))?);
        }

        Ok(actions)
    }

    fn record_failure(
        &mut self,
        local_id: CorrelationId,
    ) -> Result<Vec<ClientAction>, ClientError> {
        match self.queue.record_failure(local_id)? {
            FailureOutcome::Dropped(entry) => Ok(vec![ClientAction::SendFailed {
                local_id: entry.local_id,
                conversation_id: entry.conversation_id,
            }]),
            FailureOutcome::Retry { .. } | FailureOutcome::Unknown => Ok(Vec::new()),
        }
    }

    fn go_offline(&mut self) {
        self.phase = Phase::Offline;
        self.session_id = None;
    }
}

fn reconnect_actions(actions: Vec<ReconnectAction>) -> Vec<ClientAction> {
    actions
        .into_iter()
        .map(|action| match action {
            ReconnectAction::Dial => ClientAction::Dial,
            ReconnectAction::Wait { delay } => ClientAction::WakeAfter { delay },
            ReconnectAction::Hangup => ClientAction::Hangup,
            ReconnectAction::GiveUp { attempts } => ClientAction::GaveUp { attempts },
        })
        .collect()
}

fn send(payload: Payload) -> Result<ClientAction, ClientError> {
    Ok(ClientAction::Send(payload.into_frame()?))
}
