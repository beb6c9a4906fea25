//! CLI argument definitions using clap
//!
//! Commands:
//! - meshlog serve --config <path>
//! - meshlog check --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// meshlog - audit-logged, mesh-replicated database node
#[derive(Parser, Debug)]
#[command(name = "meshlog")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a node: host databases, accept peers, connect to peers
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./meshlog.json")]
        config: PathBuf,
    },

    /// Validate a configuration file and print a summary
    Check {
        /// Path to configuration file
        #[arg(long, default_value = "./meshlog.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
