//! Transaction errors

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for transaction operations
pub type TxnResult<T> = Result<T, TxnError>;

/// Transaction errors. Lost read conditions are not errors: `commit`
/// returns `Ok(false)` for them.
#[derive(Debug, Clone, Error)]
pub enum TxnError {
    /// Storage failed before anything was written
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Storage failed after some environments had already committed
    #[error("Commit failed in {env} after {committed} environment(s) committed: {source}")]
    PartialCommit {
        env: String,
        committed: usize,
        source: StorageError,
    },
}

impl TxnError {
    /// Returns true if the node must stop
    pub fn is_fatal(&self) -> bool {
        match self {
            TxnError::Storage(err) => err.is_fatal(),
            TxnError::PartialCommit { .. } => true,
        }
    }
}
