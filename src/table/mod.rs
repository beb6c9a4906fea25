//! Tables
//!
//! A `Database` is one storage environment with its audit store. Each table
//! is a primary store of headered records in that environment, identified
//! in audit entries by a small table id. Every write goes through a
//! `Transaction` and appends one audit entry.
//!
//! - Local writes carry node id 0 and the transaction's version
//! - Replicated writes carry the translated origin node id and the origin
//!   version; last writer (highest version) wins
//! - Stale replicated patches are rebased under the newer local patches

mod database;
mod errors;
mod replicated;
mod table;

pub use database::{Database, TABLE_IDS};
pub use errors::{TableError, TableResult};
pub use replicated::{ApplyOutcome, RemoteChange};
pub use table::{Table, TableDef, WriteOptions, INVALIDATED};
