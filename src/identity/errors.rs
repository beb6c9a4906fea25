//! Identity mapping errors

use thiserror::Error;

use crate::audit::AuditError;

/// Result type for identity operations
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Identity mapping errors
#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    /// Stored table could not be read
    #[error("Corrupt node id table: {0}")]
    Corrupt(String),

    /// Id 0 is bound to a different node name
    #[error("Audit store belongs to node {stored}, configured as {configured}")]
    SelfNameMismatch { stored: String, configured: String },

    /// No ids left
    #[error("Node id space exhausted")]
    Exhausted,

    /// Persisting the table failed
    #[error(transparent)]
    Audit(#[from] AuditError),
}
