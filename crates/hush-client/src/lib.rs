//! Client
//!
//! Action-based client for the HUSH relay. Holds the vault key, queues
//! outgoing envelopes durably and keeps one logical relay session alive
//! across reconnects.
//!
//! # Architecture
//!
//! The session follows the same Sans-IO pattern as [`hush_core`]. It receives
//! events ([`ClientEvent`]), processes them through pure state machine logic,
//! and returns actions ([`ClientAction`]) for the caller to execute.
//!
//! # Components
//!
//! - [`ClientSession`]: authentication, resubscription, reconnect backoff
//!   and acknowledgement tracking
//! - [`Vault`]: vault key, conversation key cache and envelope sealing
//! - [`OfflineDeliveryQueue`]: durable outbox with per-entry attempt limits
//! - [`BlobStore`]: the byte-blob contract local persistence must meet
//!
//! # Transport (optional)
//!
//! With the `transport` feature enabled, this crate also provides:
//! - [`transport::ConnectedClient`]: frame channels over QUIC
//! - [`transport::connect`]: connect to a relay

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod event;
mod queue;
mod session;
mod store;
mod vault;

#[cfg(feature = "transport")]
pub mod transport;

pub use error::{ClientError, QueueError, StoreError};
pub use event::{ClientAction, ClientEvent};
pub use hush_core::{Environment, ReconnectConfig, ReconnectState};
pub use queue::{
    Delivered, DrainReport, FailureOutcome, MAX_ATTEMPTS, OUTBOX_KEY, OfflineDeliveryQueue,
    QueuedMessage,
};
pub use session::{
    ClientSession, DEFAULT_ACK_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, SessionConfig, SessionState,
};
pub use store::{BlobStore, MemoryBlobStore};
pub use vault::{
    Conversation, EpochStore, INITIAL_GROUP_EPOCH, MemoryEpochStore, SealedMessage, Vault,
};
