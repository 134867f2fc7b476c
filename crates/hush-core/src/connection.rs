//! Relay-side session state machine.
//!
//! Manages connection lifecycle, heartbeats, timeouts, and graceful shutdown.
//! Uses the action pattern: methods take time as input and return actions for
//! the driver to execute. This keeps the state machine pure (no I/O).
//!
//! # State Machine
//!
//! ```text
//! accepted() ┌─────────┐ complete_handshake ┌───────────────┐
//! ──────────>│ Pending │───────────────────>│ Authenticated │
//!            └─────────┘                    └───────────────┘
//!                 │ handshake timeout,              │ goodbye,
//!                 │ goodbye                         │ missed heartbeats
//!                 ↓                                 ↓
//!            ┌──────────────────────────────────────────┐
//!            │                  Closed                  │
//!            └──────────────────────────────────────────┘
//! ```
//!
//! A connection starts `Pending` and accepts only `authenticate`, `hello` and
//! `goodbye` until a token has been presented. Token checks belong to the
//! relay driver; this machine only records the outcome through
//! [`Connection::complete_handshake`].

use std::{
    ops::Sub,
    time::{Duration, Instant},
};

use hush_proto::{
    Frame, FrameHeader, Opcode, ParticipantId, Payload,
    payloads::session::{Goodbye, HelloReply},
};

use crate::error::ConnectionError;

/// Time allowed to complete authentication and the hello exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between heartbeats while authenticated.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat intervals a peer may stay silent before it is dropped.
pub const DEFAULT_MISSED_HEARTBEATS: u32 = 2;

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send this frame to the peer
    SendFrame(Frame),

    /// Close the connection with this reason
    Close {
        /// Reason for closing the connection
        reason: String,
    },
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Pending,
    /// Token accepted, relay traffic allowed
    Authenticated,
    /// Connection closed (graceful or error)
    Closed,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for completing handshake
    pub handshake_timeout: Duration,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Silent intervals tolerated before the peer is considered gone
    pub missed_heartbeats: u32,
}

impl ConnectionConfig {
    /// Longest silence tolerated from an authenticated peer.
    #[must_use]
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(self.missed_heartbeats.max(1))
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            missed_heartbeats: DEFAULT_MISSED_HEARTBEATS,
        }
    }
}

/// Connection state machine
///
/// Manages lifecycle, timeouts, and heartbeats for one accepted transport.
/// Generic over `Instant` so tests can drive it with scripted time.
#[derive(Debug, Clone)]
pub struct Connection<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: ConnectionState,
    config: ConnectionConfig,
    /// Last time anything was received from the peer
    last_activity: I,
    last_heartbeat: Option<I>,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Connection for a freshly accepted transport, in
    /// [`ConnectionState::Pending`].
    pub fn accepted(now: I, config: ConnectionConfig) -> Self {
        Self { state: ConnectionState::Pending, config, last_activity: now, last_heartbeat: None }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Record an accepted token and reply with `HelloReply`.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` if not pending
    pub fn complete_handshake(
        &mut self,
        session_id: u64,
        participant_id: ParticipantId,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state != ConnectionState::Pending {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "complete_handshake",
            });
        }

        debug_assert_ne!(session_id, 0);

        self.state = ConnectionState::Authenticated;
        self.last_activity = now;

        let frame = Payload::HelloReply(HelloReply {
            session_id,
            participant_id,
            heartbeat_interval_secs: self.config.heartbeat_interval.as_secs(),
        })
        .into_frame()?;

        Ok(vec![ConnectionAction::SendFrame(frame)])
    }

    /// Whether a frame with `opcode` from the client may be processed in the
    /// current state.
    #[must_use]
    pub fn permits(&self, opcode: Opcode) -> bool {
        match self.state {
            ConnectionState::Pending => {
                matches!(opcode, Opcode::Authenticate | Opcode::Hello | Opcode::Goodbye)
            },
            ConnectionState::Authenticated => !matches!(
                opcode,
                Opcode::Authenticate | Opcode::Hello | Opcode::AuthGranted | Opcode::AuthDenied
            ),
            ConnectionState::Closed => false,
        }
    }

    /// Mark connection as closed.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Mark the peer as alive (call on every received frame).
    pub fn update_activity(&mut self, now: I) {
        self.last_activity = now;
    }

    /// Timeout that has fired, if any.
    #[must_use]
    pub fn check_timeout(&self, now: I) -> Option<ConnectionError> {
        let elapsed = now - self.last_activity;

        match self.state {
            ConnectionState::Pending if elapsed > self.config.handshake_timeout => {
                Some(ConnectionError::HandshakeTimeout { elapsed })
            },
            ConnectionState::Authenticated if elapsed > self.config.liveness_window() => {
                Some(ConnectionError::HeartbeatTimeout { elapsed })
            },
            _ => None,
        }
    }

    /// Process periodic maintenance (timeouts and heartbeats).
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }

        if let Some(err) = self.check_timeout(now) {
            self.close();
            return vec![ConnectionAction::Close { reason: err.to_string() }];
        }

        if self.state != ConnectionState::Authenticated {
            return Vec::new();
        }

        let due =
            self.last_heartbeat.is_none_or(|last| now - last >= self.config.heartbeat_interval);
        if !due {
            return Vec::new();
        }

        self.last_heartbeat = Some(now);
        let heartbeat = Frame::new(FrameHeader::new(Opcode::Heartbeat), Vec::new());
        vec![ConnectionAction::SendFrame(heartbeat)]
    }

    /// Process an incoming session-layer frame.
    ///
    /// Covers liveness pings and goodbye. Relay traffic, `authenticate`,
    /// `hello` and `error` frames are handled by the caller.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::UnexpectedFrame` if opcode invalid for current state
    /// - `ConnectionError::Protocol` if the payload does not decode
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.last_activity = now;

        let Some(opcode) = frame.header.opcode_enum() else {
            return Err(ConnectionError::UnexpectedFrame {
                state: self.state,
                opcode: frame.header.opcode(),
            });
        };

        match (self.state, opcode) {
            (ConnectionState::Authenticated, Opcode::Ping) => {
                let pong = Frame::new(FrameHeader::new(Opcode::Pong), Vec::new());
                Ok(vec![ConnectionAction::SendFrame(pong)])
            },

            (ConnectionState::Authenticated, Opcode::Pong) => Ok(vec![]),

            (state, Opcode::Goodbye) if state != ConnectionState::Closed => {
                let Payload::Goodbye(goodbye) = Payload::from_frame(frame)? else {
                    unreachable!("decoder maps Goodbye opcode to Goodbye payload");
                };

                self.state = ConnectionState::Closed;

                let ack = Payload::Goodbye(Goodbye { reason: "ack".to_string() }).into_frame()?;
                Ok(vec![ConnectionAction::SendFrame(ack), ConnectionAction::Close {
                    reason: format!("peer goodbye: {}", goodbye.reason),
                }])
            },

            (state, opcode) => {
                Err(ConnectionError::UnexpectedFrame { state, opcode: opcode.to_u16() })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> ParticipantId {
        ParticipantId::new("alice").unwrap()
    }

    fn opcode_of(action: &ConnectionAction) -> Option<Opcode> {
        match action {
            ConnectionAction::SendFrame(frame) => frame.header.opcode_enum(),
            ConnectionAction::Close { .. } => None,
        }
    }

    fn authenticated_relay(t0: Instant) -> Connection {
        let mut conn = Connection::accepted(t0, ConnectionConfig::default());
        conn.complete_handshake(7, pid(), t0).unwrap();
        conn
    }

    #[test]
    fn relay_handshake_replies() {
        let t0 = Instant::now();
        let mut conn = Connection::accepted(t0, ConnectionConfig::default());
        assert_eq!(conn.state(), ConnectionState::Pending);

        let actions = conn.complete_handshake(42, pid(), t0).unwrap();
        assert_eq!(conn.state(), ConnectionState::Authenticated);

        let ConnectionAction::SendFrame(frame) = &actions[0] else {
            panic!("expected HelloReply frame");
        };
        let Payload::HelloReply(reply) = Payload::from_frame(frame).unwrap() else {
            panic!("expected HelloReply payload");
        };
        assert_eq!(reply.session_id, 42);
        assert_eq!(reply.heartbeat_interval_secs, 30);
    }

    #[test]
    fn handshake_only_once() {
        let t0 = Instant::now();
        let mut conn = authenticated_relay(t0);
        let result = conn.complete_handshake(8, pid(), t0);
        assert!(matches!(result, Err(ConnectionError::InvalidState { .. })));
    }

    #[test]
    fn pending_permits_only_handshake_frames() {
        let t0 = Instant::now();
        let conn: Connection = Connection::accepted(t0, ConnectionConfig::default());

        assert!(conn.permits(Opcode::Authenticate));
        assert!(conn.permits(Opcode::Hello));
        assert!(conn.permits(Opcode::Goodbye));
        assert!(!conn.permits(Opcode::Subscribe));
        assert!(!conn.permits(Opcode::SendMessage));
        assert!(!conn.permits(Opcode::Ping));

        let conn = authenticated_relay(t0);
        assert!(conn.permits(Opcode::SendMessage));
        assert!(!conn.permits(Opcode::Hello));
    }

    #[test]
    fn pending_relay_times_out() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::accepted(t0, ConnectionConfig::default());

        assert!(conn.tick(t0 + Duration::from_secs(30)).is_empty());

        let actions = conn.tick(t0 + Duration::from_secs(31));
        assert!(matches!(actions[0], ConnectionAction::Close { .. }));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn relay_sends_heartbeat_each_interval() {
        let t0 = Instant::now();
        let mut conn = authenticated_relay(t0);

        let first = conn.tick(t0);
        assert_eq!(opcode_of(&first[0]), Some(Opcode::Heartbeat));
        assert!(conn.tick(t0 + Duration::from_secs(10)).is_empty());

        conn.update_activity(t0 + Duration::from_secs(29));
        let second = conn.tick(t0 + Duration::from_secs(30));
        assert_eq!(opcode_of(&second[0]), Some(Opcode::Heartbeat));
    }

    #[test]
    fn two_missed_intervals_close() {
        let t0 = Instant::now();
        let mut conn = authenticated_relay(t0);
        conn.tick(t0);

        // Sending heartbeats is not evidence that the peer is alive.
        let at_window = conn.tick(t0 + Duration::from_secs(60));
        assert!(!at_window.iter().any(|a| matches!(a, ConnectionAction::Close { .. })));

        let actions = conn.tick(t0 + Duration::from_secs(61));
        assert!(matches!(actions[0], ConnectionAction::Close { .. }));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn activity_keeps_connection_alive() {
        let t0 = Instant::now();
        let mut conn = authenticated_relay(t0);

        let pong = Frame::new(FrameHeader::new(Opcode::Pong), Vec::new());
        conn.handle_frame(&pong, t0 + Duration::from_secs(50)).unwrap();

        assert!(conn.check_timeout(t0 + Duration::from_secs(100)).is_none());
        assert!(conn.check_timeout(t0 + Duration::from_secs(111)).is_some());
    }

    #[test]
    fn heartbeat_from_client_is_unexpected() {
        let t0 = Instant::now();
        let mut conn = authenticated_relay(t0);

        let heartbeat = Frame::new(FrameHeader::new(Opcode::Heartbeat), Vec::new());
        let result = conn.handle_frame(&heartbeat, t0);
        assert!(matches!(result, Err(ConnectionError::UnexpectedFrame { .. })));
    }

    #[test]
    fn relay_answers_ping() {
        let t0 = Instant::now();
        let mut conn = authenticated_relay(t0);

        let ping = Frame::new(FrameHeader::new(Opcode::Ping), Vec::new());
        let actions = conn.handle_frame(&ping, t0).unwrap();
        assert_eq!(opcode_of(&actions[0]), Some(Opcode::Pong));
    }

    #[test]
    fn ping_before_authentication_rejected() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::accepted(t0, ConnectionConfig::default());

        let ping = Frame::new(FrameHeader::new(Opcode::Ping), Vec::new());
        let result = conn.handle_frame(&ping, t0);
        assert!(matches!(result, Err(ConnectionError::UnexpectedFrame { .. })));
    }

    #[test]
    fn goodbye_closes_from_any_open_state() {
        let t0 = Instant::now();
        let goodbye = Payload::Goodbye(Goodbye { reason: "bye".into() }).into_frame().unwrap();

        let mut pending: Connection = Connection::accepted(t0, ConnectionConfig::default());
        let mut authenticated = authenticated_relay(t0);

        for conn in [&mut pending, &mut authenticated] {
            let actions = conn.handle_frame(&goodbye, t0).unwrap();
            assert_eq!(conn.state(), ConnectionState::Closed);
            assert_eq!(opcode_of(&actions[0]), Some(Opcode::Goodbye));
            assert!(matches!(actions[1], ConnectionAction::Close { .. }));
        }
    }
}
