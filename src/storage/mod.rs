//! Storage environments
//!
//! A storage environment is one physical key-value database holding any
//! number of named stores (primary records, the audit log, blobs,
//! bookkeeping). The transaction, audit and replication layers only talk to
//! the traits in this module.
//!
//! # Contract
//!
//! - Every entry carries a version (f64) used for optimistic checks
//! - `prepare` validates read conditions under the environment lock; the
//!   returned guard holds the lock until it is committed or dropped
//! - Commit assigns each write a strictly increasing local time, fills
//!   timestamp placeholders, appends audit entries keyed by that local time,
//!   and publishes a `CommitNotice`
//!
//! `MemoryEnvironment` is the engine used by the node binary and the tests.

mod clock;
mod entry;
mod errors;
mod header;
mod memory;

pub use clock::{next_after, wall_clock_ms, LocalClock};
pub use entry::{spawn_read_txn_watchdog, HeaderedStore, ReadTxn, ReadTxnTracker, RecordEntry};
pub use errors::{Severity, StorageError, StorageErrorCode, StorageResult};
pub use header::{
    fill_timestamp, read_header, read_local_time, write_header, DecodedRecord, EncodeInstructions,
    HeaderError, HeaderResult, RecordEncoder, RecordHeader, HAS_EXPIRATION, HEADER_THRESHOLD,
    LITERAL_TIMESTAMP_BYTE, METADATA_BYTE, TIMESTAMP_PLACEHOLDER,
};
pub use memory::{MemoryEnvironment, MemoryStore};

use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::broadcast;

/// Name of the per-environment blob store
pub const BLOB_STORE: &str = "blobs";

/// A stored value and the version it was written with
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    /// Raw stored bytes (record header + structural value)
    pub value: Vec<u8>,
    /// Commit version
    pub version: f64,
}

/// One key/entry pair from a range scan
pub type RangeItem = (Vec<u8>, StoredEntry);

/// A named store inside an environment
pub trait KvStore: Send + Sync {
    /// Store name
    fn name(&self) -> &str;

    /// Entry at `key`
    fn get_entry(&self, key: &[u8]) -> StorageResult<Option<StoredEntry>>;

    /// Raw bytes at `key`
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.get_entry(key)?.map(|entry| entry.value))
    }

    /// Ascending scan of `[start, end)`-style bounds, at most `limit` items
    fn get_range(
        &self,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<RangeItem>>;

    /// Descending scan, at most `limit` items
    fn get_range_reverse(
        &self,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<RangeItem>>;

    /// Direct write outside any transaction (bookkeeping, blobs)
    fn put(&self, key: &[u8], value: Vec<u8>, version: f64) -> StorageResult<()>;

    /// Remove `key`. With `if_version`, only removes if the stored version
    /// still matches. Returns true if something was removed.
    fn remove(&self, key: &[u8], if_version: Option<f64>) -> StorageResult<bool>;

    /// True if the stored version at `key` equals `version` (`None` = absent)
    fn if_version(&self, key: &[u8], version: Option<f64>) -> StorageResult<bool> {
        let current = self.get_entry(key)?.map(|entry| entry.version);
        Ok(current == version)
    }
}

/// A version a read observed; commit fails unless it still holds
#[derive(Debug, Clone, PartialEq)]
pub struct ReadCondition {
    /// Store name
    pub store: String,
    /// Key read
    pub key: Vec<u8>,
    /// Version observed (`None` = key was absent)
    pub version: Option<f64>,
}

/// Audit entry appended alongside a write
#[derive(Debug, Clone, PartialEq)]
pub struct AuditWrite {
    /// Audit store name
    pub store: String,
    /// Encoded audit entry, possibly starting with the previous-time placeholder
    pub entry: Vec<u8>,
}

/// What a write does to its key
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValue {
    /// Store these bytes (a timestamp placeholder is filled at commit)
    Put(Vec<u8>),
    /// Remove the key
    Remove,
    /// Leave the key untouched; only the audit entry is appended
    AuditOnly,
}

/// One queued write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    /// Store name
    pub store: String,
    /// Key
    pub key: Vec<u8>,
    /// Effect on the key
    pub value: WriteValue,
    /// Commit version
    pub version: f64,
    /// Audit entry to append, keyed by the write's local time
    pub audit: Option<AuditWrite>,
}

/// Result of a commit: the local time assigned to each write, in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReceipt {
    /// Local times, one per write op
    pub local_times: Vec<f64>,
}

/// Published after every commit (the after-commit hook)
#[derive(Debug, Clone, PartialEq)]
pub struct CommitNotice {
    /// Environment that committed
    pub env_path: String,
    /// Local times assigned by the commit
    pub local_times: Vec<f64>,
}

/// Environment lock held between validation and commit
pub trait PreparedCommit {
    /// Apply `writes` and release the lock
    fn commit(self: Box<Self>, writes: Vec<WriteOp>) -> StorageResult<CommitReceipt>;
}

/// One physical storage environment
pub trait StorageEnvironment: Send + Sync {
    /// Environment path; also the lock ordering key for multi-environment commits
    fn path(&self) -> &str;

    /// Open a named store, creating it if needed. The flag is true if it was created.
    fn open_store(&self, name: &str) -> StorageResult<(Arc<dyn KvStore>, bool)>;

    /// Lock the environment and validate `conditions`. `None` means a
    /// condition failed and the lock has already been released.
    fn prepare<'a>(
        &'a self,
        conditions: &[ReadCondition],
    ) -> StorageResult<Option<Box<dyn PreparedCommit + 'a>>>;

    /// Receive a notice after every commit in this environment
    fn subscribe_commits(&self) -> broadcast::Receiver<CommitNotice>;

    /// Next local time from the environment clock
    fn now(&self) -> f64;

    /// Raise the environment clock so later local times exceed `timestamp`
    /// (a version received from a peer). Non-finite values are ignored.
    fn observe_time(&self, timestamp: f64);

    /// Begin a tracked read transaction
    fn begin_read(&self) -> ReadTxn;

    /// Read transaction tracker (for the leak watchdog)
    fn read_tracker(&self) -> Arc<ReadTxnTracker>;
}
