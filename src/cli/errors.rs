//! CLI-specific error types
//!
//! All CLI errors are fatal: the binary prints them and exits non-zero.

use thiserror::Error;

use crate::config::ConfigError;
use crate::replication::ReplicationError;
use crate::table::TableError;

/// CLI error
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration could not be loaded
    #[error("MESH_CLI_CONFIG_ERROR: {0}")]
    Config(#[from] ConfigError),

    /// A database or table could not be opened
    #[error("MESH_CLI_BOOT_FAILED: {0}")]
    Boot(#[from] TableError),

    /// Replication failed to start
    #[error("MESH_CLI_REPLICATION_FAILED: {0}")]
    Replication(#[from] ReplicationError),

    /// stdout, signals or the async runtime failed
    #[error("MESH_CLI_IO_ERROR: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Config(_) => "MESH_CLI_CONFIG_ERROR",
            CliError::Boot(_) => "MESH_CLI_BOOT_FAILED",
            CliError::Replication(_) => "MESH_CLI_REPLICATION_FAILED",
            CliError::Io(_) => "MESH_CLI_IO_ERROR",
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
