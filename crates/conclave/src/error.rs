//! Error types for the Conclave facade.

use conclave_core::CoreError;
use conclave_store::StoreError;
use conclave_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during Conclave operations.
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Invalid identifier or payload.
    #[error("invalid input: {0}")]
    Core(#[from] CoreError),

    /// Cache error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Discovery or sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// No group was given and none is remembered for this address.
    #[error("no group to open")]
    NoGroup,
}

impl ConclaveError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConclaveError::Sync(e) if e.is_fatal())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ConclaveError::Sync(e) => e.is_retryable(),
            ConclaveError::Store(_) => true,
            ConclaveError::Core(_) | ConclaveError::NoGroup => false,
        }
    }
}

/// Result type for Conclave operations.
pub type Result<T> = std::result::Result<T, ConclaveError>;
