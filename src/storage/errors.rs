//! Storage error types
//!
//! Error codes:
//! - MESH_STORAGE_WRITE_FAILED (ERROR severity)
//! - MESH_STORAGE_READ_FAILED (ERROR severity)
//! - MESH_STORAGE_UNKNOWN_STORE (ERROR severity)
//! - MESH_STORAGE_POISONED (FATAL severity)

use std::fmt;

/// Severity levels for storage errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, node continues
    Error,
    /// Node must terminate
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Storage-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    /// A write could not be applied
    MeshStorageWriteFailed,
    /// A read could not be served
    MeshStorageReadFailed,
    /// A named sub-store does not exist in the environment
    MeshStorageUnknownStore,
    /// An environment lock was poisoned by a panicking writer
    MeshStoragePoisoned,
}

impl StorageErrorCode {
    /// Returns the string code
    pub fn code(&self) -> &'static str {
        match self {
            StorageErrorCode::MeshStorageWriteFailed => "MESH_STORAGE_WRITE_FAILED",
            StorageErrorCode::MeshStorageReadFailed => "MESH_STORAGE_READ_FAILED",
            StorageErrorCode::MeshStorageUnknownStore => "MESH_STORAGE_UNKNOWN_STORE",
            StorageErrorCode::MeshStoragePoisoned => "MESH_STORAGE_POISONED",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            StorageErrorCode::MeshStoragePoisoned => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for StorageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Storage error with code and context
#[derive(Debug, Clone)]
pub struct StorageError {
    code: StorageErrorCode,
    message: String,
    details: Option<String>,
}

impl StorageError {
    /// Create a write failed error
    pub fn write_failed(message: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::MeshStorageWriteFailed,
            message: message.into(),
            details: None,
        }
    }

    /// Create a read failed error
    pub fn read_failed(message: impl Into<String>) -> Self {
        Self {
            code: StorageErrorCode::MeshStorageReadFailed,
            message: message.into(),
            details: None,
        }
    }

    /// Create an unknown store error
    pub fn unknown_store(store: &str) -> Self {
        Self {
            code: StorageErrorCode::MeshStorageUnknownStore,
            message: "store is not open in this environment".to_string(),
            details: Some(format!("store: {}", store)),
        }
    }

    /// Create a poisoned lock error (FATAL)
    pub fn poisoned(environment: &str) -> Self {
        Self {
            code: StorageErrorCode::MeshStoragePoisoned,
            message: "environment lock poisoned".to_string(),
            details: Some(format!("environment: {}", environment)),
        }
    }

    /// Attach context details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Returns the error code
    pub fn code(&self) -> StorageErrorCode {
        self.code
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns whether this error is fatal
    pub fn is_fatal(&self) -> bool {
        self.code.severity() == Severity::Fatal
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            StorageErrorCode::MeshStorageWriteFailed.code(),
            "MESH_STORAGE_WRITE_FAILED"
        );
        assert_eq!(
            StorageErrorCode::MeshStoragePoisoned.code(),
            "MESH_STORAGE_POISONED"
        );
    }

    #[test]
    fn test_poisoned_is_fatal() {
        assert!(StorageError::poisoned("db").is_fatal());
        assert!(!StorageError::write_failed("x").is_fatal());
    }

    #[test]
    fn test_display_contains_details() {
        let err = StorageError::unknown_store("audit");
        let display = format!("{}", err);
        assert!(display.contains("MESH_STORAGE_UNKNOWN_STORE"));
        assert!(display.contains("store: audit"));
    }
}
