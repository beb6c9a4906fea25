//! Table errors

use thiserror::Error;

use crate::audit::AuditError;
use crate::crdt::CrdtError;
use crate::storage::{HeaderError, StorageError};
use crate::txn::TxnError;

/// Result type for table operations
pub type TableResult<T> = Result<T, TableError>;

/// Table errors
#[derive(Debug, Clone, Error)]
pub enum TableError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Txn(#[from] TxnError),

    /// Record ids must be non-empty
    #[error("Invalid record id: {0:?}")]
    InvalidRecordId(String),

    /// Table definition rejected
    #[error("Invalid table {name}: {reason}")]
    InvalidTable { name: String, reason: String },

    /// Replicated entry references a table id with no local table
    #[error("Unknown table id {0}")]
    UnknownTableId(u32),

    /// Commit kept losing its read conditions
    #[error("Gave up after {attempts} conflicting attempts")]
    RetriesExhausted { attempts: usize },
}

impl TableError {
    /// Returns true if the node must stop
    pub fn is_fatal(&self) -> bool {
        match self {
            TableError::Storage(err) => err.is_fatal(),
            TableError::Audit(err) => err.is_fatal(),
            TableError::Txn(err) => err.is_fatal(),
            _ => false,
        }
    }
}
