//! Error taxonomy for the client bridge.
//!
//! Per-request failures ([`ClientError::Timeout`], [`ClientError::Cancelled`])
//! are surfaced only to the caller of that request. Session-level failures
//! ([`ClientError::ServerCrashed`]) fail every outstanding request of the
//! session but leave the bridge in a recoverable `Crashed` state.

use std::time::Duration;

use crate::types::SessionState;

/// Errors surfaced by the client bridge and its request handles.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A frame on the wire was malformed. Recovered locally by
    /// resynchronization; never surfaced to the editor unless corruption
    /// persists past the reader's tolerance.
    #[error("malformed protocol frame: {0}")]
    Protocol(String),

    /// The request did not receive a response within its timeout.
    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },

    /// The request was cancelled by the caller before a response arrived.
    #[error("request '{method}' was cancelled")]
    Cancelled { method: &'static str },

    /// The server process exited while the session was alive.
    #[error("language server crashed: {reason}")]
    ServerCrashed { reason: String },

    /// The server executable could not be started.
    #[error("failed to spawn language server '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// The server returned a JSON-RPC error for a lifecycle request.
    #[error("server rejected '{method}': {message}")]
    Rejected {
        method: &'static str,
        message: String,
    },

    /// An operation was attempted against a session that cannot accept it.
    #[error("operation not permitted while session is {state}")]
    InvalidState { state: SessionState },

    /// The internal writer channel closed underneath us.
    #[error("writer channel closed")]
    ChannelClosed,
}

impl ClientError {
    pub(crate) fn crashed(reason: impl Into<String>) -> Self {
        Self::ServerCrashed {
            reason: reason.into(),
        }
    }
}
