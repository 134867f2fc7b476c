//! HUSH protocol core
//!
//! Pure state machines shared by the relay and the client. Nothing here
//! performs I/O: methods take the current time and return actions for a
//! driver to execute.
//!
//! - [`connection`]: relay-side session lifecycle (handshake, heartbeat,
//!   timeouts, goodbye)
//! - [`reconnect`]: client reconnection with capped exponential backoff
//! - [`env`]: time and randomness, abstracted for deterministic tests

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod connection;
pub mod env;
pub mod error;
pub mod reconnect;

pub use connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState};
pub use env::Environment;
pub use error::ConnectionError;
pub use reconnect::{ReconnectAction, ReconnectConfig, ReconnectMachine, ReconnectState};
