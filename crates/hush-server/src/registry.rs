//! Connection registry for session and channel subscription tracking.
//!
//! The registry maintains bidirectional mappings: channel → sessions (for
//! fan-out) and session → channels (for cleanup on disconnect). This enables
//! O(1) lookups in both directions and lets a disconnect release every
//! subscription in one step.
//!
//! A channel is either a conversation id or a participant's self channel.
//! Self channels let a participant hear about conversations it has not
//! derived locally yet; they route, they do not authorize.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use hush_proto::{ConversationId, ParticipantId, limits::MAX_SUBSCRIPTIONS_PER_CONNECTION};
use thiserror::Error;

/// Fan-out key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Everyone following a conversation
    Conversation(ConversationId),
    /// A participant's own channel
    Participant(ParticipantId),
}

/// Information about a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Source address of the transport
    pub remote_addr: IpAddr,
    /// Participant bound by the session token (after authentication)
    pub participant_id: Option<ParticipantId>,
}

impl SessionInfo {
    /// Create a new unauthenticated session info.
    pub fn new(remote_addr: IpAddr) -> Self {
        Self { remote_addr, participant_id: None }
    }

    /// Whether the session has presented a valid token.
    pub fn is_authenticated(&self) -> bool {
        self.participant_id.is_some()
    }
}

/// Subscription failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// Session is not registered
    #[error("unknown session {0}")]
    UnknownSession(u64),

    /// Session already holds the maximum number of subscriptions
    #[error("subscription limit of {max} reached")]
    LimitReached {
        /// Per-session limit
        max: usize,
    },
}

/// Registry for tracking sessions and channel subscriptions.
#[derive(Debug)]
pub struct ConnectionRegistry {
    max_subscriptions: usize,
    /// Session ID → session info
    sessions: HashMap<u64, SessionInfo>,
    /// Channel → set of subscribed session IDs
    channel_sessions: HashMap<Channel, HashSet<u64>>,
    /// Session ID → set of subscribed channels
    session_channels: HashMap<u64, HashSet<Channel>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create a new empty registry with the default subscription limit.
    pub fn new() -> Self {
        Self::with_subscription_limit(MAX_SUBSCRIPTIONS_PER_CONNECTION)
    }

    /// Create a registry allowing `max_subscriptions` channels per session.
    pub fn with_subscription_limit(max_subscriptions: usize) -> Self {
        Self {
            max_subscriptions,
            sessions: HashMap::new(),
            channel_sessions: HashMap::new(),
            session_channels: HashMap::new(),
        }
    }

    /// Register a new session. Returns `false` if it already exists.
    pub fn register_session(&mut self, session_id: u64, info: SessionInfo) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }

        self.sessions.insert(session_id, info);
        self.session_channels.insert(session_id, HashSet::new());
        true
    }

    /// Unregister a session and remove all its subscriptions.
    ///
    /// Returns the session info if it existed, along with the channels it was
    /// subscribed to.
    pub fn unregister_session(
        &mut self,
        session_id: u64,
    ) -> Option<(SessionInfo, HashSet<Channel>)> {
        let info = self.sessions.remove(&session_id)?;
        let channels = self.session_channels.remove(&session_id).unwrap_or_default();

        for channel in &channels {
            if let Some(subscribers) = self.channel_sessions.get_mut(channel) {
                subscribers.remove(&session_id);
                if subscribers.is_empty() {
                    self.channel_sessions.remove(channel);
                }
            }
        }

        Some((info, channels))
    }

    /// Session metadata. `None` if session doesn't exist.
    pub fn session(&self, session_id: u64) -> Option<&SessionInfo> {
        self.sessions.get(&session_id)
    }

    /// Check if a session is registered.
    pub fn has_session(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Bind a participant to a registered session.
    ///
    /// Returns `false` if the session doesn't exist. A participant may hold
    /// several sessions (one per device).
    pub fn authenticate(&mut self, session_id: u64, participant_id: ParticipantId) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(info) => {
                info.participant_id = Some(participant_id);
                true
            },
            None => false,
        }
    }

    /// Subscribe a session to a channel.
    ///
    /// Idempotent: returns `Ok(false)` if the subscription already existed,
    /// even when the session is at its limit.
    pub fn subscribe(
        &mut self,
        session_id: u64,
        channel: Channel,
    ) -> Result<bool, SubscribeError> {
        let channels = self
            .session_channels
            .get_mut(&session_id)
            .ok_or(SubscribeError::UnknownSession(session_id))?;

        if channels.contains(&channel) {
            return Ok(false);
        }
        if channels.len() >= self.max_subscriptions {
            return Err(SubscribeError::LimitReached { max: self.max_subscriptions });
        }

        channels.insert(channel.clone());
        self.channel_sessions.entry(channel).or_default().insert(session_id);
        Ok(true)
    }

    /// Unsubscribe a session from a channel.
    ///
    /// Returns `true` if the session was subscribed and is now unsubscribed.
    pub fn unsubscribe(&mut self, session_id: u64, channel: &Channel) -> bool {
        let removed_from_channel =
            self.channel_sessions.get_mut(channel).is_some_and(|s| s.remove(&session_id));

        let removed_from_session =
            self.session_channels.get_mut(&session_id).is_some_and(|c| c.remove(channel));

        if self.channel_sessions.get(channel).is_some_and(HashSet::is_empty) {
            self.channel_sessions.remove(channel);
        }

        removed_from_channel && removed_from_session
    }

    /// Check if a session is subscribed to a channel.
    pub fn is_subscribed(&self, session_id: u64, channel: &Channel) -> bool {
        self.channel_sessions.get(channel).is_some_and(|s| s.contains(&session_id))
    }

    /// All sessions subscribed to a channel.
    pub fn sessions_for(&self, channel: &Channel) -> impl Iterator<Item = u64> + '_ {
        self.channel_sessions.get(channel).into_iter().flat_map(|s| s.iter().copied())
    }

    /// All channels a session is subscribed to.
    pub fn channels_for_session(&self, session_id: u64) -> impl Iterator<Item = &Channel> + '_ {
        self.session_channels.get(&session_id).into_iter().flatten()
    }

    /// Total number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions bound to a participant.
    pub fn authenticated_count(&self) -> usize {
        self.sessions.values().filter(|info| info.is_authenticated()).count()
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.channel_sessions.len()
    }

    /// Total subscriptions across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.session_channels.values().map(HashSet::len).sum()
    }

    /// Session ids currently registered.
    pub fn session_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.sessions.keys().copied()
    }
}
