//! In-memory storage environment
//!
//! Stores are ordered maps behind one environment mutex. A prepared commit
//! holds that mutex, so validation and the writes that follow it are atomic
//! with respect to every other writer in the environment.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use super::clock::LocalClock;
use super::entry::{ReadTxn, ReadTxnTracker};
use super::errors::{StorageError, StorageResult};
use super::header::{fill_timestamp, read_local_time};
use super::{
    CommitNotice, CommitReceipt, KvStore, PreparedCommit, RangeItem, ReadCondition,
    StorageEnvironment, StoredEntry, WriteOp, WriteValue,
};
use crate::audit::{audit_key, resolve_previous_time};

const COMMIT_CHANNEL_CAPACITY: usize = 1024;

type StoreMap = BTreeMap<Vec<u8>, StoredEntry>;

#[derive(Default)]
struct EnvState {
    stores: HashMap<String, StoreMap>,
}

struct EnvShared {
    path: String,
    state: Mutex<EnvState>,
    clock: LocalClock,
    commits: broadcast::Sender<CommitNotice>,
    reads: Arc<ReadTxnTracker>,
}

impl EnvShared {
    fn lock(&self) -> StorageResult<MutexGuard<'_, EnvState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::poisoned(&self.path))
    }
}

/// In-memory storage environment
#[derive(Clone)]
pub struct MemoryEnvironment {
    shared: Arc<EnvShared>,
}

impl MemoryEnvironment {
    /// Create an empty environment identified by `path`
    pub fn new(path: impl Into<String>) -> Self {
        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(EnvShared {
                path: path.into(),
                state: Mutex::new(EnvState::default()),
                clock: LocalClock::new(),
                commits,
                reads: Arc::new(ReadTxnTracker::new()),
            }),
        }
    }

    /// Store handle without creating the store
    pub fn store(&self, name: &str) -> MemoryStore {
        MemoryStore {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl StorageEnvironment for MemoryEnvironment {
    fn path(&self) -> &str {
        &self.shared.path
    }

    fn open_store(&self, name: &str) -> StorageResult<(Arc<dyn KvStore>, bool)> {
        let mut state = self.shared.lock()?;
        let created = !state.stores.contains_key(name);
        state.stores.entry(name.to_string()).or_default();
        drop(state);
        Ok((Arc::new(self.store(name)), created))
    }

    fn prepare<'a>(
        &'a self,
        conditions: &[ReadCondition],
    ) -> StorageResult<Option<Box<dyn PreparedCommit + 'a>>> {
        let state = self.shared.lock()?;
        // Most recent read first: it is the most likely to have changed.
        for condition in conditions.iter().rev() {
            let current = state
                .stores
                .get(&condition.store)
                .and_then(|store| store.get(&condition.key))
                .map(|entry| entry.version);
            if current != condition.version {
                return Ok(None);
            }
        }
        Ok(Some(Box::new(MemoryPrepared {
            shared: &self.shared,
            state,
        })))
    }

    fn subscribe_commits(&self) -> broadcast::Receiver<CommitNotice> {
        self.shared.commits.subscribe()
    }

    fn now(&self) -> f64 {
        self.shared.clock.next()
    }

    fn observe_time(&self, timestamp: f64) {
        if timestamp.is_finite() {
            self.shared.clock.observe(timestamp);
        }
    }

    fn begin_read(&self) -> ReadTxn {
        self.shared.reads.begin()
    }

    fn read_tracker(&self) -> Arc<ReadTxnTracker> {
        Arc::clone(&self.shared.reads)
    }
}

struct MemoryPrepared<'a> {
    shared: &'a EnvShared,
    state: MutexGuard<'a, EnvState>,
}

impl PreparedCommit for MemoryPrepared<'_> {
    fn commit(self: Box<Self>, writes: Vec<WriteOp>) -> StorageResult<CommitReceipt> {
        let MemoryPrepared { shared, mut state } = *self;
        let mut receipt = CommitReceipt {
            local_times: Vec::with_capacity(writes.len()),
        };

        for op in writes {
            let local_time = shared.clock.next();
            let store = state.stores.entry(op.store).or_default();
            let previous_time = store
                .get(&op.key)
                .and_then(|entry| read_local_time(&entry.value));

            match op.value {
                WriteValue::Put(mut value) => {
                    fill_timestamp(&mut value, local_time);
                    store.insert(
                        op.key,
                        StoredEntry {
                            value,
                            version: op.version,
                        },
                    );
                }
                WriteValue::Remove => {
                    store.remove(&op.key);
                }
                WriteValue::AuditOnly => {}
            }

            if let Some(audit) = op.audit {
                let entry = resolve_previous_time(audit.entry, previous_time);
                state.stores.entry(audit.store).or_default().insert(
                    audit_key(local_time).to_vec(),
                    StoredEntry {
                        value: entry,
                        version: op.version,
                    },
                );
            }
            receipt.local_times.push(local_time);
        }
        drop(state);

        if !receipt.local_times.is_empty() {
            // No receivers is not an error.
            let _ = shared.commits.send(CommitNotice {
                env_path: shared.path.clone(),
                local_times: receipt.local_times.clone(),
            });
        }
        Ok(receipt)
    }
}

/// Handle to one store of a `MemoryEnvironment`
#[derive(Clone)]
pub struct MemoryStore {
    name: String,
    shared: Arc<EnvShared>,
}

fn owned_bound(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(key.to_vec()),
        Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn valid_bounds(start: &Bound<Vec<u8>>, end: &Bound<Vec<u8>>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s <= e,
        (Bound::Included(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e))
        | (Bound::Excluded(s), Bound::Excluded(e)) => s < e,
        _ => true,
    }
}

impl MemoryStore {
    fn scan(
        &self,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
        limit: usize,
        reverse: bool,
    ) -> StorageResult<Vec<RangeItem>> {
        let start = owned_bound(start);
        let end = owned_bound(end);
        // BTreeMap::range panics on inverted bounds.
        if !valid_bounds(&start, &end) {
            return Ok(Vec::new());
        }
        let state = self.shared.lock()?;
        let Some(store) = state.stores.get(&self.name) else {
            return Ok(Vec::new());
        };
        let range = store.range((start, end));
        let items = if reverse {
            range
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            range.take(limit).map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        Ok(items)
    }
}

impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_entry(&self, key: &[u8]) -> StorageResult<Option<StoredEntry>> {
        let state = self.shared.lock()?;
        Ok(state
            .stores
            .get(&self.name)
            .and_then(|store| store.get(key))
            .cloned())
    }

    fn get_range(
        &self,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<RangeItem>> {
        self.scan(start, end, limit, false)
    }

    fn get_range_reverse(
        &self,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<RangeItem>> {
        self.scan(start, end, limit, true)
    }

    fn put(&self, key: &[u8], value: Vec<u8>, version: f64) -> StorageResult<()> {
        let mut state = self.shared.lock()?;
        state
            .stores
            .entry(self.name.clone())
            .or_default()
            .insert(key.to_vec(), StoredEntry { value, version });
        Ok(())
    }

    fn remove(&self, key: &[u8], if_version: Option<f64>) -> StorageResult<bool> {
        let mut state = self.shared.lock()?;
        let Some(store) = state.stores.get_mut(&self.name) else {
            return Ok(false);
        };
        match (store.get(key), if_version) {
            (None, _) => Ok(false),
            (Some(entry), Some(expected)) if entry.version != expected => Ok(false),
            _ => Ok(store.remove(key).is_some()),
        }
    }
}
