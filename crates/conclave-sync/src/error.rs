//! Error types for the sync module.

use thiserror::Error;

use conclave_core::CoreError;

/// Errors that can occur during discovery and sync.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A network call failed. Always retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The messaging identity could not be created. The session cannot heal.
    #[error("identity rejected: {0}")]
    IdentityRejected(String),

    /// The identity is not yet visible on the network.
    #[error("identity not yet published")]
    IdentityNotReady,

    /// Signing failed.
    #[error("signer error: {0}")]
    Signer(String),

    /// Operation requires a resolved conversation.
    #[error("no conversation resolved")]
    NotConnected,

    /// Operation not valid in the current session state.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// The governance contract could not be read.
    #[error("governance error: {0}")]
    Governance(String),

    /// Identifier or payload error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The session has been closed.
    #[error("session closed")]
    Closed,
}

impl SyncError {
    /// Fatal errors require rebuilding the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::IdentityRejected(_))
    }

    /// Retryable errors may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::IdentityNotReady | SyncError::Governance(_)
        )
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
