//! CRDT errors

use thiserror::Error;

use crate::audit::AuditError;

/// Result type for CRDT operations
pub type CrdtResult<T> = Result<T, CrdtError>;

/// CRDT replay and patch errors
#[derive(Debug, Clone, Error)]
pub enum CrdtError {
    /// Operation kind without a defined inverse
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Operand or field value is not numeric where a number is required
    #[error("Invalid operand for field {field}: {reason}")]
    InvalidOperand { field: String, reason: String },

    /// A patch payload is not a JSON object
    #[error("Patch for record {0} is not an object")]
    InvalidPatch(String),

    /// Reading the audit chain failed
    #[error(transparent)]
    Audit(#[from] AuditError),
}
