//! Defense policy engine.
//!
//! Tracks consecutive authentication failures per source address and fires
//! the configured response when they reach the threshold. Per address:
//!
//! ```text
//!            failure (count < threshold)
//!   Clean ─────────────────────────────▶ Accumulating
//!     ▲                                      │
//!     │ success                              │ failure (count == threshold)
//!     └──────────────────────────────────────┤
//!                                            ▼
//!                  ┌─────────────┬───────────┴───────┬──────────────────┐
//!                  ▼             ▼                   ▼                  ▼
//!          Blocked-Temporary  Blocked-Permanent    Wiped          Wiped+Halted
//! ```
//!
//! The counter lives in storage and is incremented atomically there, so
//! racing attempts from one address can neither lose an increment nor both
//! fire the action. The counter is reset in the same step the action fires.
//!
//! The engine performs storage side effects (blocks, wipes) itself and
//! reports what happened. Halting the process is the runtime's job.

use std::{fmt, net::IpAddr, str::FromStr, time::Duration};

use thiserror::Error;

use crate::storage::{BlockRecord, Storage, StorageError};

/// Default consecutive failures before the action fires.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Default duration of a temporary block.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(60 * 60);

/// Response to an address reaching the failure threshold.
///
/// Chosen by server configuration only; no wire message can select it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Block the address until `now + block_duration`
    TemporaryBlock,
    /// Block the address with no expiry
    PermanentBlock,
    /// Erase all conversation data and keep serving
    DataWipe,
    /// Erase all conversation data and terminate immediately
    DataWipeAndHalt,
}

impl FailureMode {
    /// Configuration name of the mode.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TemporaryBlock => "ip_temp",
            Self::PermanentBlock => "ip_perm",
            Self::DataWipe => "db_wipe",
            Self::DataWipeAndHalt => "db_wipe_shutdown",
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip_temp" => Ok(Self::TemporaryBlock),
            "ip_perm" => Ok(Self::PermanentBlock),
            "db_wipe" => Ok(Self::DataWipe),
            "db_wipe_shutdown" => Ok(Self::DataWipeAndHalt),
            other => Err(format!(
                "unknown failure mode {other:?} (expected ip_temp, ip_perm, db_wipe or \
                 db_wipe_shutdown)"
            )),
        }
    }
}

/// Defense engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefenseConfig {
    /// Consecutive failures that trigger the action
    pub max_failures: u32,
    /// Action fired at the threshold
    pub mode: FailureMode,
    /// Lifetime of a temporary block
    pub block_duration: Duration,
    /// Wipe and halt on the first failure, ignoring threshold and mode
    pub panic_mode: bool,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            mode: FailureMode::TemporaryBlock,
            block_duration: DEFAULT_BLOCK_DURATION,
            panic_mode: false,
        }
    }
}

/// Result of [`DefenseEngine::check_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// No active block
    Allowed,
    /// Address is blocked
    Denied {
        /// Unix seconds when the block lapses. `None` is permanent.
        expires_at: Option<u64>,
    },
}

/// Action fired by a failure that reached the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefenseAction {
    /// Address blocked
    Blocked {
        /// Unix seconds when the block lapses. `None` is permanent.
        expires_at: Option<u64>,
    },
    /// Conversation data erased
    Wiped {
        /// Number of envelopes erased
        erased: u64,
    },
    /// Conversation data erased; the process must terminate now
    WipedAndHalt {
        /// Number of envelopes erased
        erased: u64,
    },
}

impl DefenseAction {
    /// Whether the runtime must terminate the process.
    pub fn requires_halt(&self) -> bool {
        matches!(self, Self::WipedAndHalt { .. })
    }
}

/// Result of [`DefenseEngine::record_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Consecutive failures including this one
    pub failures: u32,
    /// Failures left before the action fires. Zero once it fired.
    pub remaining: u32,
    /// Action fired by this failure, if any
    pub action: Option<DefenseAction>,
}

/// Errors from the defense engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefenseError {
    /// Bookkeeping could not be read or written
    #[error("defense storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Per-address failure tracking and threshold actions.
///
/// Failures are keyed by source address only. Clients sharing an address
/// (NAT, carrier-grade NAT, proxies) share one counter, so one client's
/// failures can block the others.
#[derive(Clone)]
pub struct DefenseEngine<S: Storage> {
    config: DefenseConfig,
    storage: S,
}

impl<S: Storage> DefenseEngine<S> {
    /// Create an engine over `storage`.
    pub fn new(config: DefenseConfig, storage: S) -> Self {
        Self { config, storage }
    }

    /// Active configuration.
    pub fn config(&self) -> &DefenseConfig {
        &self.config
    }

    fn threshold(&self) -> u32 {
        if self.config.panic_mode { 1 } else { self.config.max_failures.max(1) }
    }

    /// Whether `addr` may attempt authentication at `now_secs`.
    ///
    /// An expired temporary block is removed here.
    pub fn check_access(
        &self,
        addr: IpAddr,
        now_secs: u64,
    ) -> Result<AccessDecision, DefenseError> {
        let Some(block) = self.storage.load_block(addr)? else {
            return Ok(AccessDecision::Allowed);
        };

        if block.is_expired(now_secs) {
            self.storage.remove_block(addr)?;
            return Ok(AccessDecision::Allowed);
        }

        Ok(AccessDecision::Denied { expires_at: block.expires_at })
    }

    /// Count a failed attempt from `addr` and fire the configured action if
    /// the threshold was reached.
    ///
    /// In panic mode the first failure wipes and requests a halt.
    pub fn record_failure(
        &self,
        addr: IpAddr,
        now_secs: u64,
    ) -> Result<FailureOutcome, DefenseError> {
        let threshold = self.threshold();
        let tally = self.storage.record_failure(addr, now_secs, threshold)?;

        if !tally.crossed {
            return Ok(FailureOutcome {
                failures: tally.count,
                remaining: threshold.saturating_sub(tally.count),
                action: None,
            });
        }

        let mode =
            if self.config.panic_mode { FailureMode::DataWipeAndHalt } else { self.config.mode };
        let action = self.fire(mode, addr, now_secs)?;

        Ok(FailureOutcome { failures: tally.count, remaining: 0, action: Some(action) })
    }

    /// Reset the failure counter after a successful attempt.
    pub fn record_success(&self, addr: IpAddr) -> Result<(), DefenseError> {
        self.storage.clear_failures(addr)?;
        Ok(())
    }

    fn fire(
        &self,
        mode: FailureMode,
        addr: IpAddr,
        now_secs: u64,
    ) -> Result<DefenseAction, DefenseError> {
        match mode {
            FailureMode::TemporaryBlock => {
                let expires_at = now_secs.saturating_add(self.config.block_duration.as_secs());
                self.block(addr, now_secs, Some(expires_at))
            },
            FailureMode::PermanentBlock => self.block(addr, now_secs, None),
            FailureMode::DataWipe => {
                let erased = self.storage.wipe_conversations()?;
                Ok(DefenseAction::Wiped { erased })
            },
            FailureMode::DataWipeAndHalt => {
                let erased = self.storage.wipe_conversations()?;
                Ok(DefenseAction::WipedAndHalt { erased })
            },
        }
    }

    fn block(
        &self,
        addr: IpAddr,
        now_secs: u64,
        expires_at: Option<u64>,
    ) -> Result<DefenseAction, DefenseError> {
        self.storage.store_block(addr, &BlockRecord { blocked_at: now_secs, expires_at })?;
        Ok(DefenseAction::Blocked { expires_at })
    }
}
