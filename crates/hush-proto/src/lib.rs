//! HUSH wire protocol.
//!
//! Every message between a client and the relay travels as a [`Frame`]: a
//! fixed 12-byte binary [`FrameHeader`] followed by a CBOR payload. The header
//! carries the [`Opcode`], so the relay can reject oversized or unknown frames
//! before touching the payload, and the payload itself never carries a
//! variant tag.
//!
//! Payloads are opaque wherever it matters: envelopes are `{ciphertext,
//! nonce}` blobs and conversation identifiers are one-way digests. Nothing in
//! this crate can describe plaintext or key material.
//!
//! # Components
//!
//! - [`Frame`] / [`FrameHeader`]: transport framing
//! - [`Payload`]: every message in both directions
//! - [`ids`]: participant, conversation, group, message and correlation ids
//! - [`limits`]: size and rate limits shared by relay and client

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod errors;
mod frame;
mod header;
pub mod ids;
pub mod limits;
mod opcode;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use ids::{ConversationId, CorrelationId, GroupId, MessageId, ParticipantId};
pub use opcode::Opcode;
pub use payloads::{Envelope, ErrorPayload, Payload};

/// ALPN protocol identifier negotiated on every QUIC connection.
pub const ALPN_PROTOCOL: &[u8] = b"hush/1";
