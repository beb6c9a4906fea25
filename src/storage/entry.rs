//! Header-lifting store wrapper and read transaction watchdog
//!
//! `HeaderedStore` wraps a raw store: reads decode the record header, lift
//! local time, metadata flags and expiration onto the returned entry, and
//! hand back only the application value.
//!
//! `ReadTxnTracker` records open read transactions; the watchdog task warns
//! about any that stay open past a threshold.

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::errors::{StorageError, StorageResult};
use super::header::RecordEncoder;
use super::{KvStore, StoredEntry};
use crate::observability::{log_event_with_fields, Event, Severity};

/// A record read through `HeaderedStore`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEntry {
    /// Application value; `None` for a tombstone
    pub value: Option<Value>,
    /// Commit version
    pub version: f64,
    /// Local time assigned at commit
    pub local_time: Option<f64>,
    /// Application metadata flags
    pub metadata_flags: u8,
    /// Expiration time
    pub expires_at: Option<f64>,
}

/// Store wrapper that decodes record headers on read
#[derive(Clone)]
pub struct HeaderedStore {
    store: Arc<dyn KvStore>,
    encoder: RecordEncoder,
}

impl HeaderedStore {
    /// Wrap `store`, decoding values with `encoder`
    pub fn new(store: Arc<dyn KvStore>, encoder: RecordEncoder) -> Self {
        Self { store, encoder }
    }

    /// The wrapped raw store
    pub fn raw(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// The record encoder
    pub fn encoder(&self) -> &RecordEncoder {
        &self.encoder
    }

    /// Decoded entry at `key`
    pub fn get_entry(&self, key: &[u8]) -> StorageResult<Option<RecordEntry>> {
        match self.store.get_entry(key)? {
            Some(stored) => self.lift(key, &stored).map(Some),
            None => Ok(None),
        }
    }

    /// Decoded value at `key` (tombstones read as `None`)
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Value>> {
        Ok(self.get_entry(key)?.and_then(|entry| entry.value))
    }

    /// Ascending scan. Entries that fail to decode are logged and skipped.
    pub fn get_range(
        &self,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<(Vec<u8>, RecordEntry)>> {
        let items = self.store.get_range(start, end, limit)?;
        Ok(items
            .into_iter()
            .filter_map(|(key, stored)| match self.lift(&key, &stored) {
                Ok(entry) => Some((key, entry)),
                Err(_) => None,
            })
            .collect())
    }

    fn lift(&self, key: &[u8], stored: &StoredEntry) -> StorageResult<RecordEntry> {
        let decoded = self.encoder.decode(&stored.value).map_err(|err| {
            let key_text = String::from_utf8_lossy(key).into_owned();
            let reason = err.to_string();
            log_event_with_fields(
                Severity::Error,
                Event::RecordDecodeFailed,
                &[
                    ("store", self.store.name()),
                    ("key", &key_text),
                    ("reason", &reason),
                ],
            );
            StorageError::read_failed(format!("cannot decode record in {}", self.store.name()))
                .with_details(reason)
        })?;
        Ok(RecordEntry {
            value: decoded.value,
            version: stored.version,
            local_time: decoded.header.local_time,
            metadata_flags: decoded.header.metadata_flags,
            expires_at: decoded.header.expires_at,
        })
    }
}

#[derive(Debug)]
struct OpenRead {
    started: Instant,
    warned: bool,
}

/// Tracks open read transactions
#[derive(Debug, Default)]
pub struct ReadTxnTracker {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, OpenRead>>,
}

impl ReadTxnTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read transaction; it is released when the guard drops
    pub fn begin(self: &Arc<Self>) -> ReadTxn {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                OpenRead {
                    started: Instant::now(),
                    warned: false,
                },
            );
        ReadTxn {
            id,
            tracker: Arc::clone(self),
        }
    }

    /// Number of open read transactions
    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Read transactions open longer than `threshold` that have not been
    /// reported yet. Each one is reported once.
    pub fn take_overdue(&self, threshold: Duration) -> Vec<(u64, Duration)> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let mut overdue = Vec::new();
        for (id, read) in open.iter_mut() {
            let elapsed = read.started.elapsed();
            if !read.warned && elapsed > threshold {
                read.warned = true;
                overdue.push((*id, elapsed));
            }
        }
        overdue
    }

    fn end(&self, id: u64) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Guard for an open read transaction
#[derive(Debug)]
pub struct ReadTxn {
    id: u64,
    tracker: Arc<ReadTxnTracker>,
}

impl ReadTxn {
    /// Tracker-assigned id
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        self.tracker.end(self.id);
    }
}

/// Spawn the leak watchdog: every `interval`, warn about read transactions
/// open longer than `threshold`. Stops on `shutdown`.
pub fn spawn_read_txn_watchdog(
    env_path: String,
    tracker: Arc<ReadTxnTracker>,
    threshold: Duration,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (id, elapsed) in tracker.take_overdue(threshold) {
                        let id = id.to_string();
                        let elapsed_ms = elapsed.as_millis().to_string();
                        log_event_with_fields(
                            Severity::Warn,
                            Event::ReadTxnLeak,
                            &[("env", &env_path), ("read_txn", &id), ("open_ms", &elapsed_ms)],
                        );
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
