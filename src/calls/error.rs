//! Call-related error types.

use meshcore::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no active call")]
    NoActiveCall,

    #[error("call already exists in chat {0}")]
    AlreadyExists(String),

    #[error("session rejected action: {0}")]
    Session(#[from] SessionError),

    #[error("relay rejected call: {0}")]
    Rejected(String),

    #[error("call manager has shut down")]
    ManagerStopped,

    #[error("calls cannot be started or answered from inside a session listener")]
    Reentrant,
}

/// Failures raised by the peer-media layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("peer endpoint {0} unavailable")]
    EndpointUnavailable(String),

    #[error("peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("connection error: {0}")]
    Connection(String),
}
