//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness) so the
//! same code runs against real clocks in production and scripted clocks in
//! tests.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production.
///   Envelope nonces are drawn from it, and a repeated nonce under one key
///   breaks confidentiality.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time as Unix seconds.
    ///
    /// Used for values that outlive the process: token expiry, block expiry
    /// and message timestamps.
    fn unix_time(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code awaits this; protocol logic never does.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`, e.g. for session ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random 16-byte identifier, e.g. for correlation ids.
    fn random_id(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        bytes
    }
}
