#![forbid(unsafe_code)]

// Routing error taxonomy. The connection handler inspects the kind to decide
// between log-and-drop and an explicit error response; no variant is fatal to
// the connection.

use crate::media::MediaError;
use thiserror::Error;

/// Errors produced while routing a single control message.
#[derive(Error, Debug)]
pub enum SignalError {
    /// Malformed message or a message not valid in the current connection
    /// state. Logged and dropped; the connection stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Message references an identity not present in the session registry.
    /// Treated as a race (the peer retries), logged and dropped.
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    /// A second join with an identity that is already registered. The joining
    /// connection gets an explicit error response; the existing session is
    /// never evicted.
    #[error("identity already in use: {0}")]
    DuplicateIdentity(String),

    /// Failure from the media engine collaborator. Surfaced to the initiating
    /// participant; partially created resources are released by the caller.
    #[error("media engine failure: {0}")]
    MediaEngine(#[from] MediaError),

    /// Failure to deliver an outbound message to one recipient. Isolated per
    /// recipient during broadcasts.
    #[error("delivery failure: {0}")]
    Delivery(String),
}

impl SignalError {
    /// Whether the originating connection should receive an `error` message,
    /// as opposed to pure log-and-drop.
    pub fn wants_error_response(&self) -> bool {
        matches!(
            self,
            SignalError::DuplicateIdentity(_) | SignalError::MediaEngine(_)
        )
    }
}

/// Result alias for routing operations.
pub type SignalResult<T> = Result<T, SignalError>;
