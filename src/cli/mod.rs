//! CLI module for meshlog
//!
//! Provides command-line interface for:
//! - serve: host the configured databases and replicate with peers
//! - check: validate a configuration file

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{check, open_node, run, run_command, serve};
pub use errors::{CliError, CliResult};
