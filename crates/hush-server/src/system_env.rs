//! Production environment: system clocks and the OS RNG.
//!
//! Envelope nonces, session ids and token keys all come from
//! [`Environment::random_bytes`], so the production implementation must be
//! backed by a cryptographically secure source.

use std::time::Duration;

use hush_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// Uses `std::time::Instant` for monotonic time, `SystemTime` for Unix
/// timestamps, `tokio::time::sleep` for delays and getrandom for entropy.
///
/// # Panics
///
/// Panics if the OS RNG fails. A relay without working randomness would
/// hand out predictable session ids and token keys, so it must not continue.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn unix_time(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - relay cannot operate securely");
    }
}
