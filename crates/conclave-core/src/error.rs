//! Error types for Conclave Core.

use thiserror::Error;

/// Core errors.
///
/// Reconciliation itself never fails; these only surface when parsing
/// identifiers or encoding payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("empty group identifier")]
    EmptyGroupId,

    #[error("invalid group identifier {input:?}: {reason}")]
    InvalidGroupId { input: String, reason: String },

    #[error("payload encoding error: {0}")]
    EncodingError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
