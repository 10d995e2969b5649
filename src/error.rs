//! Error types for the WAN link protocol.

use thiserror::Error;

use crate::messages::CodecError;

/// Failures surfaced by link bring-up and steady-state operation.
///
/// Bind, timeout and rejection errors are only produced during `up()` and
/// leave the link cleanly in Down. Transport errors after a link reaches Up
/// are logged and handled internally (best-effort data path).
#[derive(Debug, Error)]
pub enum LinkError {
    /// Local address resolution or socket bind failed.
    #[error("failed to bind link socket: {0}")]
    SocketBind(#[source] std::io::Error),

    /// A handshake step got no response within the retry budget.
    #[error("no response to {step} after {attempts} attempts")]
    HandshakeTimeout {
        /// Handshake step that timed out ("probe", "join", "configure").
        step: &'static str,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The peer answered a handshake step with an explicit error.
    #[error("peer rejected {step}: {reason}")]
    HandshakeRejected {
        /// Handshake step that was rejected.
        step: &'static str,
        /// Reason text carried by the peer's response.
        reason: String,
    },

    /// Unexpected I/O error on an established socket.
    #[error("transport failure: {0}")]
    Transport(#[source] std::io::Error),

    /// Malformed or out-of-bounds datagram.
    #[error("protocol violation: {0}")]
    Protocol(#[from] CodecError),
}
