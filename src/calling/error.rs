//! Error taxonomy for the call core.

use thiserror::Error;

/// Failure reported by the media device layer when capture is requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("no camera or microphone found: {0}")]
    NotFound(String),
    #[error("permission to use camera or microphone denied")]
    PermissionDenied,
    #[error("media access blocked by security policy")]
    Security,
    #[error("error opening camera or microphone: {0}")]
    Other(String),
}

/// Failure reported by the media-transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid connectivity candidate: {0}")]
    InvalidCandidate(String),
    #[error("no sender for {0} track")]
    NoSender(&'static str),
    #[error("{0}")]
    Other(String),
}

/// Failure reported by the signaling gateway when sending.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signaling send failed: {0}")]
pub struct SignalingError(pub String);

/// How a [`CallError`] is handled by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Surfaced to the user; the call is aborted or never starts.
    UserRecoverable,
    /// Malformed or unexpected input from the peer; the call is torn down.
    PeerProtocol,
    /// The connection failed or closed underneath us.
    TransportFailure,
    /// A single operation failed; the session carries on.
    Transient,
}

/// Errors surfaced by the call state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("you are already in an ongoing call")]
    AlreadyInCall,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("peer protocol error: {0}")]
    PeerProtocol(String),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("candidate could not be applied: {0}")]
    Candidate(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("call is closed")]
    Closed,
}

impl CallError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CallError::AlreadyInCall | CallError::Media(_) => ErrorClass::UserRecoverable,
            CallError::PeerProtocol(_) => ErrorClass::PeerProtocol,
            CallError::Transport(TransportError::InvalidDescription(_)) => {
                ErrorClass::PeerProtocol
            }
            CallError::Transport(_) | CallError::Closed => ErrorClass::TransportFailure,
            CallError::Candidate(_) | CallError::Signaling(_) => ErrorClass::Transient,
        }
    }

    /// Declining device permission is treated like the user cancelling the
    /// call, so it is never shown as an error.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            CallError::Media(MediaError::PermissionDenied | MediaError::Security)
        )
    }
}
