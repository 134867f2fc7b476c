//! Size and rate limits shared by the relay and clients.

use std::time::Duration;

/// Maximum decoded ciphertext size for a single message envelope.
pub const MAX_CIPHERTEXT_BYTES: usize = 64 * 1024;

/// AEAD nonce size. Envelopes carry exactly this many bytes.
pub const NONCE_BYTES: usize = 12;

/// Maximum number of subscriptions a single connection may hold.
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 500;

/// Maximum sends per connection within [`SEND_RATE_WINDOW`].
pub const MAX_SENDS_PER_WINDOW: usize = 30;

/// Sliding window for the per-connection send limit.
pub const SEND_RATE_WINDOW: Duration = Duration::from_secs(10);

/// Maximum number of recipient hints on a single send.
pub const MAX_RECIPIENTS: usize = 64;

/// Maximum page size for history requests.
pub const MAX_HISTORY_PAGE: u32 = 100;
