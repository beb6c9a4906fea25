//! Subscription errors

use thiserror::Error;

use crate::audit::AuditError;

/// Result type for subscription operations
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Subscription errors
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    /// A listener rejected an event
    #[error("Listener failed: {0}")]
    Listener(String),

    /// The listener's channel is closed
    #[error("Listener channel closed")]
    Closed,

    /// Reading new audit entries failed
    #[error(transparent)]
    Audit(#[from] AuditError),
}
