//! Error types for the HUSH session layer.
//!
//! Kept separate from transport errors so the state machines stay typed;
//! conversion to `io::Error` happens only at the boundary.

use std::{io, time::Duration};

use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors from the connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Invalid state transition attempted
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred
        state: ConnectionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Received unexpected frame for current state
    #[error("unexpected frame: received opcode {opcode:#06x} in state {state:?}")]
    UnexpectedFrame {
        /// Current state when frame was received
        state: ConnectionState,
        /// Opcode of the unexpected frame
        opcode: u16,
    },

    /// Handshake did not complete within timeout
    #[error("handshake timeout after {elapsed:?}")]
    HandshakeTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Peer missed too many heartbeats
    #[error("heartbeat timeout after {elapsed:?}")]
    HeartbeatTimeout {
        /// Time since the peer was last heard from
        elapsed: Duration,
    },

    /// Protocol error from frame parsing/validation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying transport error
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Timeouts and transport failures feed the reconnect machine. Protocol
    /// violations indicate a broken or malicious peer and are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. } | Self::HeartbeatTimeout { .. } | Self::Transport(_)
        )
    }
}

impl From<ConnectionError> for io::Error {
    fn from(err: ConnectionError) -> Self {
        let kind = match &err {
            ConnectionError::HandshakeTimeout { .. } | ConnectionError::HeartbeatTimeout { .. } => {
                io::ErrorKind::TimedOut
            },
            ConnectionError::InvalidState { .. }
            | ConnectionError::UnexpectedFrame { .. }
            | ConnectionError::Protocol(_) => io::ErrorKind::InvalidData,
            ConnectionError::Transport(_) => io::ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<hush_proto::ProtocolError> for ConnectionError {
    fn from(err: hush_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
