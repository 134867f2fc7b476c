//! Relay driver: Sans-IO orchestrator for the zero-knowledge relay.
//!
//! The driver owns every piece of relay state (session state machines,
//! the subscription registry, the authentication gate) and turns
//! [`RelayEvent`]s into [`RelayAction`]s. It performs storage calls itself
//! but never touches the network, never logs and never exits; the runtime
//! executes the actions.
//!
//! # Ordering
//!
//! The runtime serializes every call into the driver. A broadcast's fan-out
//! is emitted as one [`RelayAction::Deliver`] carrying a snapshot of the
//! subscriber set, so index mutation and the actual sends never overlap, and
//! deliveries for one conversation leave in the order the broadcasts
//! completed.
//!
//! # Envelopes
//!
//! Envelopes are checked for size only. Nothing here can open one.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use hush_core::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionState, Environment,
};
use hush_crypto::TokenKey;
use hush_proto::{
    ConversationId, ErrorPayload, Frame, FrameHeader, Opcode, ParticipantId, Payload,
    limits::{MAX_HISTORY_PAGE, MAX_RECIPIENTS, MAX_SUBSCRIPTIONS_PER_CONNECTION},
    payloads::{
        relay::{
            ConversationRef, ExpiredMessages, HistoryPage, HistoryRequest, MessageAck,
            OutboundMessage, SelfSubscribed,
        },
        session::{Authenticate, Hello},
    },
};

use crate::{
    auth::{AuthConfig, AuthGate, AuthOutcome},
    defense::{AccessDecision, DefenseAction, DefenseConfig, DefenseEngine},
    rate_limit::SendWindow,
    registry::{Channel, ConnectionRegistry, SessionInfo, SubscribeError},
    server_error::DriverError,
    storage::{ExpiredMessage, MessageDraft, Storage, StoreOutcome},
    telemetry::{Counter, Telemetry, TelemetrySnapshot},
};

/// Bytes reserved per history entry on top of its ciphertext.
const HISTORY_ENTRY_OVERHEAD: usize = 160;

/// Envelopes purged per tick. The rest wait for the next tick.
const EXPIRY_BATCH: usize = 500;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Session timeouts and heartbeat interval
    pub connection: ConnectionConfig,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum subscriptions per connection
    pub max_subscriptions: usize,
    /// Knowledge proof, KDF salt and token lifetime
    pub auth: AuthConfig,
    /// Failure threshold and action
    pub defense: DefenseConfig,
    /// How long stored envelopes are kept. `None` keeps them until a wipe.
    pub message_ttl: Option<Duration>,
}

impl RelayConfig {
    /// Default limits around the given authentication settings.
    pub fn new(auth: AuthConfig) -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_connections: 10_000,
            max_subscriptions: MAX_SUBSCRIPTIONS_PER_CONNECTION,
            auth,
            defense: DefenseConfig::default(),
            message_ttl: None,
        }
    }
}

/// Events that the relay processes.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A transport connection was accepted.
    ConnectionAccepted {
        /// Runtime-assigned session id
        session_id: u64,
        /// Source address of the transport
        remote_addr: IpAddr,
    },

    /// A frame was received from a session.
    FrameReceived {
        /// Sending session
        session_id: u64,
        /// The frame
        frame: Frame,
    },

    /// A transport connection went away.
    ConnectionClosed {
        /// Closed session
        session_id: u64,
        /// Why it closed
        reason: String,
    },

    /// Periodic tick for heartbeats, timeouts and envelope expiry.
    Tick,
}

/// Actions the runtime must execute.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayAction {
    /// Send a frame to one session.
    SendToSession {
        /// Target session
        session_id: u64,
        /// Frame to send
        frame: Frame,
    },

    /// Fan a frame out to a snapshot of subscribers.
    ///
    /// A failed send to one session must not stop delivery to the rest.
    Deliver {
        /// Target sessions
        session_ids: Vec<u64>,
        /// Frame to send
        frame: Frame,
    },

    /// Close a transport connection.
    CloseConnection {
        /// Session to close
        session_id: u64,
        /// Reason for closing
        reason: String,
    },

    /// Operational log line.
    Log {
        /// Severity
        level: LogLevel,
        /// Message
        message: String,
    },

    /// Security event, logged under the `hush::security` target.
    ///
    /// Carries addresses and counts only.
    SecurityEvent {
        /// Severity
        level: LogLevel,
        /// Message
        message: String,
    },

    /// Terminate the process immediately, without draining.
    Halt {
        /// Reason, logged before exiting
        reason: String,
    },
}

/// Log levels for relay actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level
    Debug,
    /// Informational
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Snapshot of relay occupancy and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    /// Open connections
    pub connections: usize,
    /// Connections that presented a valid token
    pub authenticated: usize,
    /// Channels with at least one subscriber
    pub channels: usize,
    /// Subscriptions across all connections
    pub subscriptions: usize,
    /// Totals since the driver started
    pub counters: TelemetrySnapshot,
}

struct Session<I>
where
    I: Copy + Ord + Send + Sync + std::ops::Sub<Output = std::time::Duration>,
{
    connection: Connection<I>,
    sends: SendWindow<I>,
}

/// Action-based relay orchestrator.
pub struct RelayDriver<E: Environment, S: Storage> {
    env: E,
    storage: S,
    config: RelayConfig,
    auth: AuthGate<S, E::Instant>,
    registry: ConnectionRegistry,
    sessions: HashMap<u64, Session<E::Instant>>,
    telemetry: Arc<Telemetry>,
    halted: bool,
}

impl<E: Environment, S: Storage> RelayDriver<E, S> {
    /// Create a driver. `token_key` signs session tokens for this relay.
    pub fn new(env: E, storage: S, config: RelayConfig, token_key: TokenKey) -> Self {
        let defense = DefenseEngine::new(config.defense, storage.clone());
        let auth = AuthGate::new(config.auth.clone(), token_key, defense);
        let registry = ConnectionRegistry::with_subscription_limit(config.max_subscriptions);

        Self {
            env,
            storage,
            config,
            auth,
            registry,
            sessions: HashMap::new(),
            telemetry: Arc::new(Telemetry::default()),
            halted: false,
        }
    }

    /// Process an event and return the resulting actions.
    ///
    /// After a halt has been requested every event is ignored.
    pub fn process_event(&mut self, event: RelayEvent) -> Result<Vec<RelayAction>, DriverError> {
        if self.halted {
            return Ok(Vec::new());
        }

        match event {
            RelayEvent::ConnectionAccepted { session_id, remote_addr } => {
                self.connect(session_id, remote_addr)
            },
            RelayEvent::FrameReceived { session_id, frame } => {
                self.handle_frame(session_id, &frame)
            },
            RelayEvent::ConnectionClosed { session_id, reason } => {
                Ok(self.release(session_id, &reason))
            },
            RelayEvent::Tick => Ok(self.handle_tick()),
        }
    }

    /// Register a freshly accepted transport as a pending connection.
    ///
    /// Blocked addresses and connections beyond the limit are closed
    /// immediately.
    pub fn connect(
        &mut self,
        session_id: u64,
        remote_addr: IpAddr,
    ) -> Result<Vec<RelayAction>, DriverError> {
        if self.sessions.contains_key(&session_id) {
            return Err(DriverError::SessionAlreadyExists(session_id));
        }

        if self.sessions.len() >= self.config.max_connections {
            return Ok(vec![
                RelayAction::CloseConnection {
                    session_id,
                    reason: "server at capacity".to_string(),
                },
                RelayAction::Log {
                    level: LogLevel::Warn,
                    message: format!(
                        "rejected connection {session_id}: max connections ({}) reached",
                        self.config.max_connections
                    ),
                },
            ]);
        }

        match self.auth.defense().check_access(remote_addr, self.env.unix_time()) {
            Ok(AccessDecision::Allowed) => {},
            Ok(AccessDecision::Denied { .. }) => {
                return Ok(vec![
                    RelayAction::SecurityEvent {
                        level: LogLevel::Warn,
                        message: format!("refused connection from blocked address {remote_addr}"),
                    },
                    RelayAction::CloseConnection {
                        session_id,
                        reason: "address blocked".to_string(),
                    },
                ]);
            },
            Err(e) => {
                return Ok(vec![
                    RelayAction::Log {
                        level: LogLevel::Error,
                        message: format!("block lookup failed for {remote_addr}: {e}"),
                    },
                    RelayAction::CloseConnection {
                        session_id,
                        reason: "internal error".to_string(),
                    },
                ]);
            },
        }

        let now = self.env.now();
        self.sessions.insert(session_id, Session {
            connection: Connection::accepted(now, self.config.connection.clone()),
            sends: SendWindow::default(),
        });
        self.registry.register_session(session_id, SessionInfo::new(remote_addr));

        Ok(vec![RelayAction::Log {
            level: LogLevel::Debug,
            message: format!("connection {session_id} accepted from {remote_addr}"),
        }])
    }

    /// Subscribe an authenticated session to a conversation.
    ///
    /// Idempotent. Replies `subscribed`, or `error` at the subscription limit.
    pub fn subscribe(
        &mut self,
        session_id: u64,
        conversation_id: ConversationId,
    ) -> Result<Vec<RelayAction>, DriverError> {
        self.participant(session_id)?;

        match self.registry.subscribe(session_id, Channel::Conversation(conversation_id)) {
            Ok(_) => {
                let reply = Payload::Subscribed(ConversationRef { conversation_id });
                Ok(vec![reply_to(session_id, reply)?])
            },
            Err(SubscribeError::LimitReached { max }) => {
                let reply = Payload::Error(ErrorPayload::subscription_limit(max));
                Ok(vec![reply_to(session_id, reply)?])
            },
            Err(SubscribeError::UnknownSession(id)) => Err(DriverError::SessionNotFound(id)),
        }
    }

    /// Subscribe an authenticated session to its participant's own channel.
    pub fn subscribe_self(&mut self, session_id: u64) -> Result<Vec<RelayAction>, DriverError> {
        let participant_id = self.participant(session_id)?;

        match self.registry.subscribe(session_id, Channel::Participant(participant_id.clone())) {
            Ok(_) => {
                let reply = Payload::SelfSubscribed(SelfSubscribed { participant_id });
                Ok(vec![reply_to(session_id, reply)?])
            },
            Err(SubscribeError::LimitReached { max }) => {
                let reply = Payload::Error(ErrorPayload::subscription_limit(max));
                Ok(vec![reply_to(session_id, reply)?])
            },
            Err(SubscribeError::UnknownSession(id)) => Err(DriverError::SessionNotFound(id)),
        }
    }

    /// Drop a conversation subscription. Replies `unsubscribed` either way.
    pub fn unsubscribe(
        &mut self,
        session_id: u64,
        conversation_id: ConversationId,
    ) -> Result<Vec<RelayAction>, DriverError> {
        self.participant(session_id)?;

        self.registry.unsubscribe(session_id, &Channel::Conversation(conversation_id));

        let reply = Payload::Unsubscribed(ConversationRef { conversation_id });
        Ok(vec![reply_to(session_id, reply)?])
    }

    /// Close a session and release all of its subscriptions at once.
    pub fn disconnect(&mut self, session_id: u64, reason: &str) -> Vec<RelayAction> {
        if !self.sessions.contains_key(&session_id) {
            return Vec::new();
        }

        let mut actions = vec![RelayAction::CloseConnection {
            session_id,
            reason: reason.to_string(),
        }];
        actions.extend(self.release(session_id, reason));
        actions
    }

    /// Persist an envelope and compute its fan-out.
    ///
    /// The audience is every session subscribed to the conversation plus
    /// every session on a recipient's self channel, each at most once. A
    /// retried send (same correlation id) is not delivered again.
    pub fn broadcast(
        &mut self,
        draft: &MessageDraft,
        sender_id: Option<ParticipantId>,
        recipients: &[ParticipantId],
    ) -> Result<(StoreOutcome, Option<RelayAction>), DriverError> {
        let outcome = self.storage.store_message(draft)?;

        let StoreOutcome::Stored(message) = &outcome else {
            return Ok((outcome, None));
        };

        let session_ids = self.audience(draft.conversation_id, recipients);
        if session_ids.is_empty() {
            return Ok((outcome, None));
        }

        let frame = Payload::Message(message.to_delivered(sender_id)).into_frame()?;
        self.telemetry.increment(Counter::Deliveries, session_ids.len() as u64);
        Ok((outcome, Some(RelayAction::Deliver { session_ids, frame })))
    }

    /// Client-facing send: validate, persist, acknowledge the sender and fan
    /// out.
    ///
    /// The acknowledgement means "persisted", not "delivered". Validation,
    /// rate limit and storage failures are reported to the sender as `error`
    /// frames carrying the correlation id.
    pub fn send_message(
        &mut self,
        session_id: u64,
        message: OutboundMessage,
    ) -> Result<Vec<RelayAction>, DriverError> {
        let sender_id = self.participant(session_id)?;
        let correlation_id = message.correlation_id;
        let now = self.env.now();

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return Err(DriverError::SessionNotFound(session_id));
        };

        if let Err(wait) = session.sends.try_acquire(now) {
            let retry_after = wait.as_secs_f64().ceil().max(1.0) as u64;
            let error = ErrorPayload::rate_limited(retry_after).for_correlation(correlation_id);
            return Ok(vec![reply_to(session_id, Payload::Error(error))?]);
        }

        if let Err(e) = message.envelope.validate() {
            let error =
                ErrorPayload::invalid_payload(e.to_string()).for_correlation(correlation_id);
            return Ok(vec![reply_to(session_id, Payload::Error(error))?]);
        }

        if message.recipients.len() > MAX_RECIPIENTS {
            let error = ErrorPayload::invalid_payload(format!(
                "at most {MAX_RECIPIENTS} recipients per message"
            ))
            .for_correlation(correlation_id);
            return Ok(vec![reply_to(session_id, Payload::Error(error))?]);
        }

        let created_at = self.env.unix_time();
        let draft = MessageDraft {
            conversation_id: message.conversation_id,
            correlation_id,
            envelope: message.envelope,
            epoch: message.epoch,
            created_at,
            expires_at: self.config.message_ttl.map(|ttl| created_at.saturating_add(ttl.as_secs())),
        };

        let (outcome, fanout) = match self.broadcast(&draft, Some(sender_id), &message.recipients)
        {
            Ok(result) => result,
            Err(DriverError::Storage(e)) => {
                let error = ErrorPayload::storage_error().for_correlation(correlation_id);
                return Ok(vec![
                    RelayAction::Log {
                        level: LogLevel::Error,
                        message: format!("failed to persist envelope: {e}"),
                    },
                    reply_to(session_id, Payload::Error(error))?,
                ]);
            },
            Err(e) => return Err(e),
        };

        let stored = outcome.message();
        let ack = Payload::Ack(MessageAck {
            correlation_id,
            id: stored.id,
            created_at: stored.created_at,
        });

        let mut actions = vec![reply_to(session_id, ack)?];
        if let StoreOutcome::Duplicate(_) = outcome {
            actions.push(RelayAction::Log {
                level: LogLevel::Debug,
                message: format!(
                    "retried send {correlation_id} acknowledged as message {}",
                    stored.id
                ),
            });
        }
        actions.extend(fanout);

        Ok(actions)
    }

    /// Page through a conversation's stored envelopes.
    ///
    /// Pages hold at most [`MAX_HISTORY_PAGE`] entries and are trimmed
    /// further so the reply fits in one frame.
    pub fn history(
        &mut self,
        session_id: u64,
        request: HistoryRequest,
    ) -> Result<Vec<RelayAction>, DriverError> {
        self.participant(session_id)?;

        let limit = request.limit.clamp(1, MAX_HISTORY_PAGE) as usize;
        let messages = match self.storage.load_messages(
            request.conversation_id,
            request.after,
            limit + 1,
        ) {
            Ok(messages) => messages,
            Err(e) => {
                return Ok(vec![
                    RelayAction::Log {
                        level: LogLevel::Error,
                        message: format!("failed to load history: {e}"),
                    },
                    reply_to(session_id, Payload::Error(ErrorPayload::storage_error()))?,
                ]);
            },
        };

        let budget = FrameHeader::MAX_PAYLOAD_SIZE as usize / 2;
        let mut used = 0;
        let mut page = Vec::with_capacity(messages.len().min(limit));
        let mut has_more = false;

        for message in &messages {
            let cost = message.envelope.ciphertext.len() + HISTORY_ENTRY_OVERHEAD;
            if page.len() == limit || (!page.is_empty() && used + cost > budget) {
                has_more = true;
                break;
            }
            used += cost;
            page.push(message.to_delivered(None));
        }

        let reply = Payload::HistoryPage(HistoryPage {
            conversation_id: request.conversation_id,
            messages: page,
            has_more,
        });
        Ok(vec![reply_to(session_id, reply)?])
    }

    /// Current occupancy.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.registry.session_count(),
            authenticated: self.registry.authenticated_count(),
            channels: self.registry.channel_count(),
            subscriptions: self.registry.subscription_count(),
            counters: self.telemetry.snapshot(),
        }
    }

    /// Counter handle shared with the runtime.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session state, if the session exists.
    pub fn session_state(&self, session_id: u64) -> Option<ConnectionState> {
        self.sessions.get(&session_id).map(|s| s.connection.state())
    }

    /// Whether a session currently receives a conversation's broadcasts.
    pub fn is_subscribed(&self, session_id: u64, conversation_id: ConversationId) -> bool {
        self.registry.is_subscribed(session_id, &Channel::Conversation(conversation_id))
    }

    /// Whether a halt has been requested.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn participant(&self, session_id: u64) -> Result<ParticipantId, DriverError> {
        let info =
            self.registry.session(session_id).ok_or(DriverError::SessionNotFound(session_id))?;
        info.participant_id.clone().ok_or(DriverError::NotAuthenticated(session_id))
    }

    fn audience(&self, conversation_id: ConversationId, recipients: &[ParticipantId]) -> Vec<u64> {
        let mut targets: BTreeSet<u64> =
            self.registry.sessions_for(&Channel::Conversation(conversation_id)).collect();

        for recipient in recipients {
            targets.extend(self.registry.sessions_for(&Channel::Participant(recipient.clone())));
        }

        targets.into_iter().collect()
    }

    /// Drop all state for a session whose transport is gone.
    fn release(&mut self, session_id: u64, reason: &str) -> Vec<RelayAction> {
        let had_session = self.sessions.remove(&session_id).is_some();
        let released = self.registry.unregister_session(session_id);

        if !had_session && released.is_none() {
            return Vec::new();
        }

        let subscriptions = released.map_or(0, |(_, channels)| channels.len());
        vec![RelayAction::Log {
            level: LogLevel::Debug,
            message: format!(
                "connection {session_id} closed: {reason} ({subscriptions} subscriptions released)"
            ),
        }]
    }

    fn handle_frame(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<RelayAction>, DriverError> {
        let now = self.env.now();
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return Err(DriverError::SessionNotFound(session_id));
        };

        // Any frame proves the peer is alive.
        session.connection.update_activity(now);

        let Some(opcode) = frame.header.opcode_enum() else {
            let error = ErrorPayload::unexpected_frame(format!(
                "unknown opcode {:#06x}",
                frame.header.opcode()
            ));
            return Ok(vec![reply_to(session_id, Payload::Error(error))?]);
        };

        if !session.connection.permits(opcode) {
            let error = if session.connection.state() == ConnectionState::Pending {
                ErrorPayload::not_authenticated()
            } else {
                ErrorPayload::unexpected_frame(format!("{opcode:?} not allowed"))
            };
            return Ok(vec![reply_to(session_id, Payload::Error(error))?]);
        }

        match opcode {
            Opcode::Ping | Opcode::Pong | Opcode::Goodbye => {
                return self.handle_session_frame(session_id, frame);
            },
            Opcode::Error => {
                return Ok(vec![RelayAction::Log {
                    level: LogLevel::Debug,
                    message: format!("session {session_id} reported an error"),
                }]);
            },
            _ => {},
        }

        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(e) => {
                let error = ErrorPayload::invalid_payload(e.to_string());
                return Ok(vec![reply_to(session_id, Payload::Error(error))?]);
            },
        };

        match payload {
            Payload::Authenticate(request) => self.handle_authenticate(session_id, &request),
            Payload::Hello(hello) => self.handle_hello(session_id, &hello),
            Payload::Subscribe(ConversationRef { conversation_id }) => {
                self.subscribe(session_id, conversation_id)
            },
            Payload::Unsubscribe(ConversationRef { conversation_id }) => {
                self.unsubscribe(session_id, conversation_id)
            },
            Payload::SubscribeSelf => self.subscribe_self(session_id),
            Payload::SendMessage(message) => self.send_message(session_id, message),
            Payload::History(request) => self.history(session_id, request),
            other => {
                let error =
                    ErrorPayload::unexpected_frame(format!("{:?} is relay-only", other.opcode()));
                Ok(vec![reply_to(session_id, Payload::Error(error))?])
            },
        }
    }

    fn handle_session_frame(
        &mut self,
        session_id: u64,
        frame: &Frame,
    ) -> Result<Vec<RelayAction>, DriverError> {
        let now = self.env.now();
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return Err(DriverError::SessionNotFound(session_id));
        };

        match session.connection.handle_frame(frame, now) {
            Ok(actions) => Ok(self.connection_actions(session_id, actions)),
            Err(e) => {
                let error = ErrorPayload::unexpected_frame(e.to_string());
                Ok(vec![reply_to(session_id, Payload::Error(error))?])
            },
        }
    }

    fn handle_authenticate(
        &mut self,
        session_id: u64,
        request: &Authenticate,
    ) -> Result<Vec<RelayAction>, DriverError> {
        let remote = self.remote_addr(session_id)?;
        let (now, now_secs) = (self.env.now(), self.env.unix_time());

        let outcome = match self.auth.authenticate(remote, request, now, now_secs) {
            Ok(outcome) => outcome,
            Err(e) => {
                return Ok(vec![
                    RelayAction::Log {
                        level: LogLevel::Error,
                        message: format!("defense bookkeeping failed for {remote}: {e}"),
                    },
                    reply_to(session_id, Payload::Error(ErrorPayload::storage_error()))?,
                ]);
            },
        };

        let mut actions = vec![reply_to(session_id, outcome.to_payload())?];

        match outcome {
            AuthOutcome::Granted(_) => actions.push(RelayAction::SecurityEvent {
                level: LogLevel::Info,
                message: format!("authentication succeeded from {remote}"),
            }),
            AuthOutcome::RateLimited { retry_after } => actions.push(RelayAction::SecurityEvent {
                level: LogLevel::Warn,
                message: format!("authentication rate limited for {remote} ({retry_after}s)"),
            }),
            AuthOutcome::Blocked { .. } => {
                actions.push(RelayAction::SecurityEvent {
                    level: LogLevel::Warn,
                    message: format!("authentication attempt from blocked address {remote}"),
                });
                actions.extend(self.disconnect(session_id, "address blocked"));
            },
            AuthOutcome::Rejected { remaining, action } => {
                self.telemetry.increment(Counter::AuthFailures, 1);
                actions.push(RelayAction::SecurityEvent {
                    level: LogLevel::Warn,
                    message: match remaining {
                        Some(remaining) => format!(
                            "authentication failed from {remote} ({remaining} attempts remaining)"
                        ),
                        None => format!("authentication failed from {remote}"),
                    },
                });
                if let Some(action) = action {
                    actions.extend(self.defense_actions(session_id, remote, action));
                }
            },
        }

        Ok(actions)
    }

    fn defense_actions(
        &mut self,
        session_id: u64,
        remote: IpAddr,
        action: DefenseAction,
    ) -> Vec<RelayAction> {
        let panic_mode = self.config.defense.panic_mode;

        match action {
            DefenseAction::Blocked { expires_at } => {
                self.telemetry.increment(Counter::Blocks, 1);
                let mut actions = vec![RelayAction::SecurityEvent {
                    level: LogLevel::Warn,
                    message: match expires_at {
                        Some(at) => format!("address {remote} blocked until {at}"),
                        None => format!("address {remote} blocked permanently"),
                    },
                }];
                actions.extend(self.disconnect(session_id, "address blocked"));
                actions
            },
            DefenseAction::Wiped { erased } => {
                self.telemetry.increment(Counter::Wipes, 1);
                vec![RelayAction::SecurityEvent {
                    level: LogLevel::Error,
                    message: format!(
                        "conversation data wiped after failures from {remote} ({erased} envelopes)"
                    ),
                }]
            },
            DefenseAction::WipedAndHalt { erased } => {
                self.telemetry.increment(Counter::Wipes, 1);
                self.halted = true;
                let trigger = if panic_mode { "panic mode triggered" } else { "threshold reached" };
                vec![
                    RelayAction::SecurityEvent {
                        level: LogLevel::Error,
                        message: format!(
                            "{trigger} by {remote}: conversation data wiped ({erased} envelopes)"
                        ),
                    },
                    RelayAction::Halt { reason: format!("defense shutdown ({trigger})") },
                ]
            },
        }
    }

    fn handle_hello(
        &mut self,
        session_id: u64,
        hello: &Hello,
    ) -> Result<Vec<RelayAction>, DriverError> {
        let remote = self.remote_addr(session_id)?;
        let (now, now_secs) = (self.env.now(), self.env.unix_time());

        match self.auth.defense().check_access(remote, now_secs) {
            Ok(AccessDecision::Allowed) => {},
            Ok(AccessDecision::Denied { .. }) => {
                let mut actions = vec![RelayAction::SecurityEvent {
                    level: LogLevel::Warn,
                    message: format!("session token presented from blocked address {remote}"),
                }];
                actions.extend(self.disconnect(session_id, "address blocked"));
                return Ok(actions);
            },
            Err(e) => {
                let mut actions = vec![RelayAction::Log {
                    level: LogLevel::Error,
                    message: format!("block lookup failed for {remote}: {e}"),
                }];
                actions.extend(self.disconnect(session_id, "internal error"));
                return Ok(actions);
            },
        }

        let Some(claims) = self.auth.verify_token(&hello.token, now_secs) else {
            let mut actions = vec![
                reply_to(session_id, Payload::Error(ErrorPayload::not_authenticated()))?,
                RelayAction::SecurityEvent {
                    level: LogLevel::Warn,
                    message: format!("invalid session token from {remote}"),
                },
            ];
            actions.extend(self.disconnect(session_id, "invalid session token"));
            return Ok(actions);
        };

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return Err(DriverError::SessionNotFound(session_id));
        };
        let connection_actions =
            session.connection.complete_handshake(session_id, claims.participant_id.clone(), now)?;
        self.registry.authenticate(session_id, claims.participant_id);

        let mut actions = self.connection_actions(session_id, connection_actions);
        actions.push(RelayAction::Log {
            level: LogLevel::Info,
            message: format!("session {session_id} authenticated"),
        });
        Ok(actions)
    }

    fn handle_tick(&mut self) -> Vec<RelayAction> {
        let now = self.env.now();
        self.auth.prune(now);

        let mut actions = Vec::new();
        let mut closing = Vec::new();

        for (&session_id, session) in &mut self.sessions {
            for action in session.connection.tick(now) {
                match action {
                    ConnectionAction::SendFrame(frame) => {
                        actions.push(RelayAction::SendToSession { session_id, frame });
                    },
                    ConnectionAction::Close { reason } => closing.push((session_id, reason)),
                }
            }
        }

        for (session_id, reason) in closing {
            actions.extend(self.disconnect(session_id, &reason));
        }

        actions.extend(self.purge_expired());
        actions
    }

    /// Remove envelopes past their expiry and tell subscribers which ones.
    fn purge_expired(&mut self) -> Vec<RelayAction> {
        let expired = match self.storage.purge_expired(self.env.unix_time(), EXPIRY_BATCH) {
            Ok(expired) => expired,
            Err(e) => {
                self.telemetry.increment(Counter::ExpiryFailures, 1);
                return vec![RelayAction::Log {
                    level: LogLevel::Error,
                    message: format!("envelope expiry failed: {e}"),
                }];
            },
        };

        if expired.is_empty() {
            return Vec::new();
        }
        self.telemetry.increment(Counter::MessagesExpired, expired.len() as u64);

        let mut actions = vec![RelayAction::Log {
            level: LogLevel::Info,
            message: format!("purged {} expired envelopes", expired.len()),
        }];

        let mut by_conversation: BTreeMap<ConversationId, Vec<_>> = BTreeMap::new();
        for ExpiredMessage { conversation_id, id } in expired {
            by_conversation.entry(conversation_id).or_default().push(id);
        }

        for (conversation_id, ids) in by_conversation {
            let session_ids: Vec<u64> =
                self.registry.sessions_for(&Channel::Conversation(conversation_id)).collect();
            if session_ids.is_empty() {
                continue;
            }

            match Payload::Expired(ExpiredMessages { conversation_id, ids }).into_frame() {
                Ok(frame) => actions.push(RelayAction::Deliver { session_ids, frame }),
                Err(e) => actions.push(RelayAction::Log {
                    level: LogLevel::Error,
                    message: format!("failed to encode expiry notice: {e}"),
                }),
            }
        }

        actions
    }

    fn connection_actions(
        &mut self,
        session_id: u64,
        actions: Vec<ConnectionAction>,
    ) -> Vec<RelayAction> {
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                ConnectionAction::SendFrame(frame) => {
                    out.push(RelayAction::SendToSession { session_id, frame });
                },
                ConnectionAction::Close { reason } => {
                    out.extend(self.disconnect(session_id, &reason));
                },
            }
        }
        out
    }

    fn remote_addr(&self, session_id: u64) -> Result<IpAddr, DriverError> {
        self.registry
            .session(session_id)
            .map(|info| info.remote_addr)
            .ok_or(DriverError::SessionNotFound(session_id))
    }
}

fn reply_to(session_id: u64, payload: Payload) -> Result<RelayAction, DriverError> {
    Ok(RelayAction::SendToSession { session_id, frame: payload.into_frame()? })
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        time::{Duration, Instant},
    };

    use hush_crypto::knowledge_proof;
    use hush_proto::{CorrelationId, Envelope, payloads::session::Goodbye};

    use super::*;
    use crate::{auth::DEFAULT_TOKEN_TTL, storage::MemoryStorage};

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            // Using real Instant for simplicity in unit tests
            Instant::now()
        }

        fn unix_time(&self) -> u64 {
            1_700_000_000
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            use rand::RngCore;
            rand::thread_rng().fill_bytes(buffer);
        }
    }

    fn driver() -> RelayDriver<TestEnv, MemoryStorage> {
        let auth = AuthConfig {
            proof_hash: knowledge_proof("open sesame"),
            kdf_salt: vec![9; 16],
            token_ttl: DEFAULT_TOKEN_TTL,
        };
        RelayDriver::new(
            TestEnv,
            MemoryStorage::new(),
            RelayConfig::new(auth),
            TokenKey::from_bytes([3; 32]),
        )
    }

    fn decode_reply(action: &RelayAction) -> Payload {
        match action {
            RelayAction::SendToSession { frame, .. } => Payload::from_frame(frame).unwrap(),
            other => panic!("expected SendToSession, got {other:?}"),
        }
    }

    fn frame(payload: Payload) -> Frame {
        payload.into_frame().unwrap()
    }

    fn authenticated(driver: &mut RelayDriver<TestEnv, MemoryStorage>, session_id: u64) {
        driver.connect(session_id, ADDR).unwrap();

        let request = Authenticate {
            proof: knowledge_proof("open sesame").to_vec(),
            participant_id: ParticipantId::new(format!("p{session_id}")).unwrap(),
        };
        let actions = driver
            .process_event(RelayEvent::FrameReceived {
                session_id,
                frame: frame(Payload::Authenticate(request)),
            })
            .unwrap();
        let Payload::AuthGranted(granted) = decode_reply(&actions[0]) else {
            panic!("expected AuthGranted");
        };

        driver
            .process_event(RelayEvent::FrameReceived {
                session_id,
                frame: frame(Payload::Hello(Hello { token: granted.token })),
            })
            .unwrap();
    }

    #[test]
    fn accepted_connection_is_pending() {
        let mut driver = driver();

        let actions = driver.connect(1, ADDR).unwrap();

        assert_eq!(driver.session_state(1), Some(ConnectionState::Pending));
        assert!(matches!(actions[0], RelayAction::Log { level: LogLevel::Debug, .. }));
        assert!(matches!(driver.connect(1, ADDR), Err(DriverError::SessionAlreadyExists(1))));
    }

    #[test]
    fn rejects_when_max_connections_exceeded() {
        let auth =
            AuthConfig { proof_hash: [0; 32], kdf_salt: vec![1], token_ttl: DEFAULT_TOKEN_TTL };
        let config = RelayConfig { max_connections: 1, ..RelayConfig::new(auth) };
        let mut driver =
            RelayDriver::new(TestEnv, MemoryStorage::new(), config, TokenKey::from_bytes([0; 32]));

        driver.connect(1, ADDR).unwrap();
        let actions = driver.connect(2, ADDR).unwrap();

        assert_eq!(driver.connection_count(), 1);
        assert!(matches!(actions[0], RelayAction::CloseConnection { session_id: 2, .. }));
    }

    #[test]
    fn pending_session_cannot_subscribe() {
        let mut driver = driver();
        driver.connect(1, ADDR).unwrap();

        let conversation_id = ConversationId([1; 32]);
        let subscribe = Payload::Subscribe(ConversationRef { conversation_id });
        let actions = driver
            .process_event(RelayEvent::FrameReceived { session_id: 1, frame: frame(subscribe) })
            .unwrap();

        let Payload::Error(error) = decode_reply(&actions[0]) else {
            panic!("expected error");
        };
        assert_eq!(error.code, ErrorPayload::NOT_AUTHENTICATED);
        assert!(!driver.is_subscribed(1, ConversationId([1; 32])));
    }

    #[test]
    fn hello_with_valid_token_authenticates() {
        let mut driver = driver();

        authenticated(&mut driver, 1);

        assert_eq!(driver.session_state(1), Some(ConnectionState::Authenticated));
        assert_eq!(driver.stats().authenticated, 1);
    }

    #[test]
    fn forged_token_closes_session() {
        let mut driver = driver();
        driver.connect(1, ADDR).unwrap();

        let hello = Payload::Hello(Hello { token: "70.1.00".into() });
        let actions = driver
            .process_event(RelayEvent::FrameReceived { session_id: 1, frame: frame(hello) })
            .unwrap();

        assert!(actions.iter().any(|a| matches!(a, RelayAction::CloseConnection { .. })));
        assert!(actions.iter().any(|a| matches!(a, RelayAction::SecurityEvent { .. })));
        assert_eq!(driver.connection_count(), 0);
    }

    #[test]
    fn subscribe_and_unsubscribe_reply() {
        let mut driver = driver();
        authenticated(&mut driver, 1);
        let conversation_id = ConversationId([4; 32]);

        let actions = driver.subscribe(1, conversation_id).unwrap();
        assert_eq!(
            decode_reply(&actions[0]),
            Payload::Subscribed(ConversationRef { conversation_id })
        );
        assert!(driver.is_subscribed(1, conversation_id));

        let actions = driver.unsubscribe(1, conversation_id).unwrap();
        assert_eq!(
            decode_reply(&actions[0]),
            Payload::Unsubscribed(ConversationRef { conversation_id })
        );
        assert!(!driver.is_subscribed(1, conversation_id));
    }

    #[test]
    fn send_acks_then_delivers() {
        let mut driver = driver();
        authenticated(&mut driver, 1);
        authenticated(&mut driver, 2);
        let conversation_id = ConversationId([5; 32]);
        driver.subscribe(2, conversation_id).unwrap();

        let actions = driver
            .send_message(1, OutboundMessage {
                conversation_id,
                envelope: Envelope { ciphertext: vec![1; 32], nonce: [2; 12] },
                correlation_id: CorrelationId([6; 16]),
                epoch: None,
                recipients: Vec::new(),
            })
            .unwrap();

        assert!(matches!(decode_reply(&actions[0]), Payload::Ack(_)));
        let RelayAction::Deliver { session_ids, frame } = &actions[1] else {
            panic!("expected Deliver");
        };
        assert_eq!(session_ids, &vec![2]);
        let Payload::Message(delivered) = Payload::from_frame(frame).unwrap() else {
            panic!("expected Message");
        };
        assert_eq!(delivered.sender_id, Some(ParticipantId::new("p1").unwrap()));
    }

    #[test]
    fn goodbye_releases_subscriptions() {
        let mut driver = driver();
        authenticated(&mut driver, 1);
        driver.subscribe(1, ConversationId([1; 32])).unwrap();

        let goodbye = Payload::Goodbye(Goodbye { reason: "logout".into() });
        let actions = driver
            .process_event(RelayEvent::FrameReceived { session_id: 1, frame: frame(goodbye) })
            .unwrap();

        assert!(actions.iter().any(|a| matches!(a, RelayAction::CloseConnection { .. })));
        assert_eq!(driver.stats(), RelayStats::default());
    }

    #[test]
    fn connection_closed_is_idempotent() {
        let mut driver = driver();
        driver.connect(1, ADDR).unwrap();

        let closed = || RelayEvent::ConnectionClosed { session_id: 1, reason: "gone".into() };
        assert_eq!(driver.process_event(closed()).unwrap().len(), 1);
        assert!(driver.process_event(closed()).unwrap().is_empty());
    }
}
