//! Relay counters.
//!
//! Counters are shared between the driver and the runtime (queue overflows
//! happen outside the driver lock), so they are plain atomics behind an
//! `Arc`. Only totals are kept; nothing here identifies a participant.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing relay counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Failed knowledge proofs
    AuthFailures,
    /// Addresses blocked by the defense policy
    Blocks,
    /// Data wipes triggered by the defense policy
    Wipes,
    /// Frames fanned out to subscribers, counted per recipient session
    Deliveries,
    /// Connections dropped because their outbound queue filled up
    QueueOverflows,
    /// Envelopes removed by the retention policy
    MessagesExpired,
    /// Retention passes that failed in storage
    ExpiryFailures,
}

impl Counter {
    const COUNT: usize = 7;

    fn index(self) -> usize {
        self as usize
    }
}

/// Shared counter set.
#[derive(Debug, Default)]
pub struct Telemetry {
    counters: [AtomicU64; Counter::COUNT],
}

impl Telemetry {
    /// Add `by` to a counter.
    pub fn increment(&self, counter: Counter, by: u64) {
        self.counters[counter.index()].fetch_add(by, Ordering::Relaxed);
    }

    /// Current value of one counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            auth_failures: self.get(Counter::AuthFailures),
            blocks: self.get(Counter::Blocks),
            wipes: self.get(Counter::Wipes),
            deliveries: self.get(Counter::Deliveries),
            queue_overflows: self.get(Counter::QueueOverflows),
            messages_expired: self.get(Counter::MessagesExpired),
            expiry_failures: self.get(Counter::ExpiryFailures),
        }
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetrySnapshot {
    /// Failed knowledge proofs
    pub auth_failures: u64,
    /// Addresses blocked
    pub blocks: u64,
    /// Data wipes
    pub wipes: u64,
    /// Per-session deliveries
    pub deliveries: u64,
    /// Slow connections dropped
    pub queue_overflows: u64,
    /// Envelopes purged by retention
    pub messages_expired: u64,
    /// Failed retention passes
    pub expiry_failures: u64,
}
