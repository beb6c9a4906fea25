//! Audit log error types
//!
//! Error codes:
//! - MESH_AUDIT_DECODE_FAILED (ERROR severity)
//! - MESH_AUDIT_ENCODE_FAILED (ERROR severity)
//! - MESH_AUDIT_STORAGE (severity of the underlying storage error)

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for audit operations
pub type AuditResult<T> = Result<T, AuditError>;

/// Audit log errors
#[derive(Debug, Clone, Error)]
pub enum AuditError {
    /// Entry bytes could not be parsed
    #[error("MESH_AUDIT_DECODE_FAILED: {reason} (leading bytes: {hex})")]
    Decode { reason: String, hex: String },

    /// Entry fields cannot be represented in the binary layout
    #[error("MESH_AUDIT_ENCODE_FAILED: {0}")]
    Encode(String),

    /// Underlying storage failure
    #[error("MESH_AUDIT_STORAGE: {0}")]
    Storage(#[from] StorageError),
}

impl AuditError {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            AuditError::Decode { .. } => "MESH_AUDIT_DECODE_FAILED",
            AuditError::Encode(_) => "MESH_AUDIT_ENCODE_FAILED",
            AuditError::Storage(_) => "MESH_AUDIT_STORAGE",
        }
    }

    /// Returns true if the node must stop
    pub fn is_fatal(&self) -> bool {
        match self {
            AuditError::Storage(err) => err.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let err = AuditError::Encode("username too long".into());
        assert_eq!(err.code(), "MESH_AUDIT_ENCODE_FAILED");
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("username too long"));
    }

    #[test]
    fn test_storage_fatality_propagates() {
        let err: AuditError = StorageError::poisoned("env-a").into();
        assert_eq!(err.code(), "MESH_AUDIT_STORAGE");
        assert!(err.is_fatal());
    }
}
