//! Client reconnection state machine.
//!
//! ```text
//! Disconnected ─connect()─> Connecting ─on_connected()─> Connected
//!      ^                      ^    │                        │
//!      │ logout / give up     │    │ on_connect_failed()    │ on_disconnected()
//!      │                      │    ↓                        ↓
//!      └──────────────── Reconnecting <─────────────────────┘
//!                          (backoff timer, tick())
//! ```
//!
//! Backoff doubles from `base_delay` up to `max_delay`. After `max_attempts`
//! consecutive failures the machine gives up and waits for an explicit
//! [`ReconnectMachine::connect`]. [`ReconnectMachine::logout`] cancels
//! reconnection entirely; a dropped transport after logout is not a failure.

use std::{
    ops::{Add, Sub},
    time::Duration,
};

/// First retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Retry delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Consecutive failed attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Reconnect configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any retry delay
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay)
    }
}

/// Reconnect state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState<I> {
    /// No connection and none being attempted
    Disconnected,
    /// Dial in progress
    Connecting {
        /// Failures so far in this run
        attempt: u32,
    },
    /// Transport up
    Connected,
    /// Waiting for the backoff timer
    Reconnecting {
        /// Failures so far in this run
        attempt: u32,
        /// When to dial again
        retry_at: I,
    },
}

/// Actions returned by the reconnect machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Open a transport connection
    Dial,
    /// Wake up after `delay` and call `tick`
    Wait {
        /// Backoff delay
        delay: Duration,
    },
    /// Close the current transport
    Hangup,
    /// Retries exhausted; explicit user action is required
    GiveUp {
        /// Attempts made
        attempts: u32,
    },
}

/// Reconnect state machine.
///
/// Generic over `Instant` for scripted time in tests.
#[derive(Debug, Clone)]
pub struct ReconnectMachine<I> {
    config: ReconnectConfig,
    state: ReconnectState<I>,
    auto_reconnect: bool,
}

impl<I> ReconnectMachine<I>
where
    I: Copy + Ord + Add<Duration, Output = I> + Sub<Output = Duration>,
{
    /// Create a machine in [`ReconnectState::Disconnected`].
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, state: ReconnectState::Disconnected, auto_reconnect: false }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ReconnectState<I> {
        self.state
    }

    /// Whether drops are followed by automatic retries.
    #[must_use]
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Explicit connect request. Resets the attempt counter and re-enables
    /// automatic reconnection.
    pub fn connect(&mut self) -> Vec<ReconnectAction> {
        self.auto_reconnect = true;
        match self.state {
            ReconnectState::Connected | ReconnectState::Connecting { .. } => Vec::new(),
            ReconnectState::Disconnected | ReconnectState::Reconnecting { .. } => {
                self.state = ReconnectState::Connecting { attempt: 0 };
                vec![ReconnectAction::Dial]
            },
        }
    }

    /// Transport established.
    pub fn on_connected(&mut self) -> Vec<ReconnectAction> {
        if !self.auto_reconnect {
            // Logged out while the dial was in flight.
            return vec![ReconnectAction::Hangup];
        }
        self.state = ReconnectState::Connected;
        Vec::new()
    }

    /// Dial failed or timed out.
    pub fn on_connect_failed(&mut self, now: I) -> Vec<ReconnectAction> {
        let attempt = match self.state {
            ReconnectState::Connecting { attempt } => attempt,
            _ => return Vec::new(),
        };
        self.schedule_retry(attempt + 1, now)
    }

    /// Established transport dropped.
    pub fn on_disconnected(&mut self, now: I) -> Vec<ReconnectAction> {
        if self.state != ReconnectState::Connected {
            return Vec::new();
        }
        self.schedule_retry(1, now)
    }

    /// Fire the backoff timer if it is due.
    pub fn tick(&mut self, now: I) -> Vec<ReconnectAction> {
        match self.state {
            ReconnectState::Reconnecting { attempt, retry_at } if now >= retry_at => {
                self.state = ReconnectState::Connecting { attempt };
                vec![ReconnectAction::Dial]
            },
            _ => Vec::new(),
        }
    }

    /// Explicit logout. Cancels any pending retry and disables automatic
    /// reconnection until the next [`Self::connect`].
    pub fn logout(&mut self) -> Vec<ReconnectAction> {
        self.auto_reconnect = false;
        let previous = std::mem::replace(&mut self.state, ReconnectState::Disconnected);
        match previous {
            ReconnectState::Connected | ReconnectState::Connecting { .. } => {
                vec![ReconnectAction::Hangup]
            },
            ReconnectState::Disconnected | ReconnectState::Reconnecting { .. } => Vec::new(),
        }
    }

    fn schedule_retry(&mut self, attempt: u32, now: I) -> Vec<ReconnectAction> {
        if !self.auto_reconnect {
            self.state = ReconnectState::Disconnected;
            return Vec::new();
        }

        if attempt > self.config.max_attempts {
            self.state = ReconnectState::Disconnected;
            self.auto_reconnect = false;
            return vec![ReconnectAction::GiveUp { attempts: attempt - 1 }];
        }

        let delay = self.config.backoff(attempt);
        self.state = ReconnectState::Reconnecting { attempt, retry_at: now + delay };
        vec![ReconnectAction::Wait { delay }]
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn backoff_schedule_doubles_then_caps() {
        let config = ReconnectConfig::default();
        let delays: Vec<u64> = (1..=8).map(|n| config.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn drop_schedules_retry_then_dials() {
        let t0 = Instant::now();
        let mut machine = ReconnectMachine::new(ReconnectConfig::default());

        assert_eq!(machine.connect(), vec![ReconnectAction::Dial]);
        machine.on_connected();
        assert_eq!(machine.state(), ReconnectState::Connected);

        assert_eq!(machine.on_disconnected(t0), vec![ReconnectAction::Wait { delay: secs(1) }]);
        assert!(machine.tick(t0).is_empty());
        assert_eq!(machine.tick(t0 + secs(1)), vec![ReconnectAction::Dial]);
        assert_eq!(machine.state(), ReconnectState::Connecting { attempt: 1 });
    }

    #[test]
    fn success_resets_attempts() {
        let t0 = Instant::now();
        let mut machine = ReconnectMachine::new(ReconnectConfig::default());
        machine.connect();
        machine.on_connect_failed(t0);
        machine.tick(t0 + secs(1));
        machine.on_connect_failed(t0 + secs(1));
        machine.tick(t0 + secs(3));
        machine.on_connected();

        assert_eq!(
            machine.on_disconnected(t0 + secs(10)),
            vec![ReconnectAction::Wait { delay: secs(1) }]
        );
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let t0 = Instant::now();
        let config = ReconnectConfig { max_attempts: 2, ..ReconnectConfig::default() };
        let mut machine = ReconnectMachine::new(config);
        machine.connect();

        assert_eq!(machine.on_connect_failed(t0), vec![ReconnectAction::Wait { delay: secs(1) }]);
        machine.tick(t0 + secs(1));
        assert_eq!(machine.on_connect_failed(t0), vec![ReconnectAction::Wait { delay: secs(2) }]);
        machine.tick(t0 + secs(3));
        assert_eq!(machine.on_connect_failed(t0), vec![ReconnectAction::GiveUp { attempts: 2 }]);

        assert_eq!(machine.state(), ReconnectState::Disconnected);
        assert!(machine.tick(t0 + secs(100)).is_empty());
        assert_eq!(machine.connect(), vec![ReconnectAction::Dial]);
    }

    #[test]
    fn logout_disables_reconnect() {
        let t0 = Instant::now();
        let mut machine = ReconnectMachine::new(ReconnectConfig::default());
        machine.connect();
        machine.on_connected();

        assert_eq!(machine.logout(), vec![ReconnectAction::Hangup]);
        assert!(!machine.auto_reconnect());
        assert!(machine.on_disconnected(t0).is_empty());
        assert_eq!(machine.state(), ReconnectState::Disconnected);
    }

    #[test]
    fn logout_cancels_pending_retry() {
        let t0 = Instant::now();
        let mut machine = ReconnectMachine::new(ReconnectConfig::default());
        machine.connect();
        machine.on_connect_failed(t0);

        assert!(machine.logout().is_empty());
        assert!(machine.tick(t0 + secs(60)).is_empty());
    }

    #[test]
    fn dial_completing_after_logout_hangs_up() {
        let mut machine: ReconnectMachine<Instant> =
            ReconnectMachine::new(ReconnectConfig::default());
        machine.connect();
        machine.logout();

        assert_eq!(machine.on_connected(), vec![ReconnectAction::Hangup]);
        assert_eq!(machine.state(), ReconnectState::Disconnected);
    }
}
