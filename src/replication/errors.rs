//! Replication errors
//!
//! Only `is_fatal` errors stop a node. Everything else closes (and later
//! re-opens) one connection, or is logged and skipped per message.

use thiserror::Error;

use crate::audit::AuditError;
use crate::identity::IdentityError;
use crate::table::TableError;

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Replication errors
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Message could not be parsed
    #[error("Malformed replication message: {0}")]
    Malformed(String),

    /// Control message with an opcode this node does not know
    #[error("Unknown opcode {0}")]
    UnknownOpcode(u8),

    /// Message not valid in the connection's current state
    #[error("Unexpected {message} while {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: &'static str,
    },

    /// Peer asked for a database this node does not host
    #[error("Unknown database {0}")]
    UnknownDatabase(String),

    /// Socket failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection closed by the peer or by shutdown
    #[error("Connection closed")]
    Closed,

    /// Replication settings rejected
    #[error("Invalid replication configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Table(#[from] TableError),
}

impl ReplicationError {
    /// Returns true if the node must stop
    pub fn is_fatal(&self) -> bool {
        match self {
            ReplicationError::Audit(err) => err.is_fatal(),
            ReplicationError::Table(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Returns true if the connection survives the error and only the
    /// offending message is dropped
    pub fn skips_message(&self) -> bool {
        match self {
            ReplicationError::Malformed(_)
            | ReplicationError::UnknownOpcode(_)
            | ReplicationError::UnexpectedMessage { .. } => true,
            ReplicationError::Table(err) => !err.is_fatal(),
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ReplicationError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ReplicationError::Transport(err.to_string())
    }
}
