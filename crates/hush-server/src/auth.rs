//! Authentication gate.
//!
//! Turns a knowledge proof of the shared passphrase into a session token.
//! Checks run in a fixed order, cheapest and least revealing first:
//!
//! 1. per-address rate limit
//! 2. active block from the defense engine
//! 3. constant-time comparison of the proof with the configured hash
//!
//! A match resets the address's failure counter and returns a token plus the
//! public KDF salt. A mismatch feeds the defense engine, which may fire its
//! threshold action.

use std::{net::IpAddr, ops::Sub, time::Duration};

use hush_crypto::{SessionClaims, TokenKey, constant_time_eq};
use hush_proto::{
    Payload,
    payloads::session::{AuthDenied, AuthGranted, Authenticate, DenialReason},
};

use crate::{
    defense::{AccessDecision, DefenseAction, DefenseEngine, DefenseError},
    rate_limit::{AuthRateLimiter, BucketConfig},
    storage::Storage,
};

/// Default session token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Authentication settings held by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// SHA-256 of the normalized shared passphrase
    pub proof_hash: [u8; 32],
    /// Public salt clients feed into vault key derivation
    pub kdf_salt: Vec<u8>,
    /// Lifetime of issued session tokens
    pub token_ttl: Duration,
}

/// Result of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Proof matched
    Granted(AuthGranted),
    /// Too many attempts from this address
    RateLimited {
        /// Seconds until the next attempt is admitted
        retry_after: u64,
    },
    /// Address is blocked
    Blocked {
        /// Unix seconds when the block lapses. `None` is permanent.
        expires_at: Option<u64>,
    },
    /// Proof did not match
    Rejected {
        /// Attempts left before the defense action. Hidden in panic mode.
        remaining: Option<u32>,
        /// Defense action fired by this failure
        action: Option<DefenseAction>,
    },
}

impl AuthOutcome {
    /// Reply sent to the client.
    pub fn to_payload(&self) -> Payload {
        let reason = match self {
            Self::Granted(granted) => return Payload::AuthGranted(granted.clone()),
            Self::RateLimited { retry_after } => {
                DenialReason::RateLimited { retry_after: *retry_after }
            },
            Self::Blocked { expires_at } => DenialReason::Blocked { expires_at: *expires_at },
            Self::Rejected { remaining, .. } => {
                DenialReason::InvalidProof { remaining_attempts: *remaining }
            },
        };
        Payload::AuthDenied(AuthDenied { reason })
    }
}

/// Knowledge-proof authentication backed by the defense engine.
pub struct AuthGate<S: Storage, I> {
    config: AuthConfig,
    token_key: TokenKey,
    limiter: AuthRateLimiter<I>,
    defense: DefenseEngine<S>,
}

impl<S, I> AuthGate<S, I>
where
    S: Storage,
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create a gate with the default rate limit.
    pub fn new(config: AuthConfig, token_key: TokenKey, defense: DefenseEngine<S>) -> Self {
        Self { config, token_key, limiter: AuthRateLimiter::new(BucketConfig::default()), defense }
    }

    /// Replace the per-address rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, config: BucketConfig) -> Self {
        self.limiter = AuthRateLimiter::new(config);
        self
    }

    /// Defense engine consulted by this gate.
    pub fn defense(&self) -> &DefenseEngine<S> {
        &self.defense
    }

    /// Process one authentication attempt from `addr`.
    pub fn authenticate(
        &mut self,
        addr: IpAddr,
        request: &Authenticate,
        now: I,
        now_secs: u64,
    ) -> Result<AuthOutcome, DefenseError> {
        if let Err(wait) = self.limiter.check(addr, now) {
            let retry_after = wait.as_secs_f64().ceil().max(1.0) as u64;
            return Ok(AuthOutcome::RateLimited { retry_after });
        }

        if let AccessDecision::Denied { expires_at } = self.defense.check_access(addr, now_secs)? {
            return Ok(AuthOutcome::Blocked { expires_at });
        }

        if constant_time_eq(&request.proof, &self.config.proof_hash) {
            self.defense.record_success(addr)?;

            let expires_at = now_secs.saturating_add(self.config.token_ttl.as_secs());
            let token = self.token_key.issue(&SessionClaims {
                participant_id: request.participant_id.clone(),
                expires_at,
            });

            return Ok(AuthOutcome::Granted(AuthGranted {
                token,
                kdf_salt: self.config.kdf_salt.clone(),
                expires_at,
            }));
        }

        let outcome = self.defense.record_failure(addr, now_secs)?;
        let remaining = (!self.defense.config().panic_mode).then_some(outcome.remaining);

        Ok(AuthOutcome::Rejected { remaining, action: outcome.action })
    }

    /// Claims of a token issued by this gate, if it is genuine and unexpired.
    pub fn verify_token(&self, token: &str, now_secs: u64) -> Option<SessionClaims> {
        self.token_key.verify(token, now_secs).ok()
    }

    /// Drop idle rate limit state.
    pub fn prune(&mut self, now: I) {
        self.limiter.prune(now);
    }
}
