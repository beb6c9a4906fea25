//! meshlog CLI entry point
//!
//! Parses arguments, runs the command and exits non-zero on failure. All
//! logic lives in the library's `cli` module.

use meshlog::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
