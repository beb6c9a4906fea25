//! Audit store
//!
//! Append-only log of audit entries keyed by local time (f64 BE, so byte
//! order is numeric order). Bookkeeping lives under sentinel keys (`0xFF` +
//! name) that sort after every numeric key:
//!
//! - `last-removed`: retention watermark, seeded when the store is created
//! - `node-ids`: node identity mapping
//! - `resume:<peer>`: replication resume time per peer

use std::collections::{HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;

use super::cleanup::RetentionPolicy;
use super::entry::{read_audit_entry, ActionKind, AuditEntryView, HAS_BLOBS};
use super::errors::AuditResult;
use crate::observability::{log_event_with_fields, Event, Severity};
use crate::storage::{wall_clock_ms, HeaderedStore, KvStore, StorageEnvironment, BLOB_STORE};

/// Name of the audit store inside an environment
pub const AUDIT_STORE: &str = "audit";

/// First byte of every sentinel key
pub const SENTINEL_PREFIX: u8 = 0xff;

/// Sentinel holding the retention watermark
pub const LAST_REMOVED: &str = "last-removed";

/// Sentinel holding the node identity mapping
pub const NODE_IDS: &str = "node-ids";

const RESUME_PREFIX: &str = "resume:";

/// Field name marking a blob reference: `{"__blob__": "<id>"}`
pub const BLOB_REF_KEY: &str = "__blob__";

/// Audit key for a local time
pub fn audit_key(local_time: f64) -> [u8; 8] {
    local_time.to_be_bytes()
}

/// Key for a bookkeeping sentinel
pub fn sentinel_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 1);
    key.push(SENTINEL_PREFIX);
    key.extend_from_slice(name.as_bytes());
    key
}

/// A decoded audit store key
#[derive(Debug, Clone, PartialEq)]
pub enum AuditKey {
    /// Entry keyed by local time
    Time(f64),
    /// Bookkeeping sentinel
    Sentinel(String),
}

/// Decode an audit store key
pub fn parse_audit_key(key: &[u8]) -> Option<AuditKey> {
    match key.first() {
        Some(&SENTINEL_PREFIX) => Some(AuditKey::Sentinel(
            String::from_utf8_lossy(&key[1..]).into_owned(),
        )),
        Some(_) if key.len() == 8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(key);
            Some(AuditKey::Time(f64::from_be_bytes(bytes)))
        }
        _ => None,
    }
}

fn decode_f64(bytes: &[u8]) -> Option<f64> {
    let array: [u8; 8] = bytes.try_into().ok()?;
    Some(f64::from_be_bytes(array))
}

/// Blob ids referenced anywhere in `value`
pub fn blob_ids(value: &Value) -> HashSet<String> {
    let mut ids = HashSet::new();
    collect_blob_ids(value, &mut ids);
    ids
}

fn collect_blob_ids(value: &Value, ids: &mut HashSet<String>) {
    match value {
        Value::Object(map) => {
            if let (1, Some(Value::String(id))) = (map.len(), map.get(BLOB_REF_KEY)) {
                ids.insert(id.clone());
                return;
            }
            for child in map.values() {
                collect_blob_ids(child, ids);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_blob_ids(child, ids);
            }
        }
        _ => {}
    }
}

/// Passed to a table's callback when its tombstone is physically removed
#[derive(Debug, Clone, PartialEq)]
pub struct TombstoneRemoval {
    pub table_id: u32,
    pub record_id: String,
    pub version: f64,
}

/// Callback run after a tombstone is removed
pub type TombstoneCallback = Arc<dyn Fn(&TombstoneRemoval) + Send + Sync>;

struct TableRegistration {
    primary: HeaderedStore,
    on_tombstone_removed: Option<TombstoneCallback>,
}

/// Append-only audit log of one storage environment
pub struct AuditStore {
    env: Arc<dyn StorageEnvironment>,
    store: Arc<dyn KvStore>,
    blobs: Arc<dyn KvStore>,
    policy: RetentionPolicy,
    pressure: Mutex<f64>,
    tables: RwLock<HashMap<u32, TableRegistration>>,
    pub(super) cleanup_running: AtomicBool,
    clock_checked: AtomicBool,
}

impl AuditStore {
    /// Open (or create) the audit store of `env`. A newly created store gets
    /// a `last-removed` watermark of now.
    pub fn open(env: Arc<dyn StorageEnvironment>, policy: RetentionPolicy) -> AuditResult<Arc<Self>> {
        let (store, created) = env.open_store(AUDIT_STORE)?;
        let (blobs, _) = env.open_store(BLOB_STORE)?;
        if created {
            let now = env.now();
            store.put(&sentinel_key(LAST_REMOVED), now.to_be_bytes().to_vec(), 0.0)?;
        }
        log_event_with_fields(
            Severity::Info,
            Event::AuditStoreOpened,
            &[("env", env.path()), ("created", if created { "true" } else { "false" })],
        );
        Ok(Arc::new(Self {
            env,
            store,
            blobs,
            policy,
            pressure: Mutex::new(0.0),
            tables: RwLock::new(HashMap::new()),
            cleanup_running: AtomicBool::new(false),
            clock_checked: AtomicBool::new(false),
        }))
    }

    /// Owning environment
    pub fn env(&self) -> &Arc<dyn StorageEnvironment> {
        &self.env
    }

    /// Store name
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Retention policy
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Entry at `local_time`
    pub fn get(&self, local_time: f64) -> AuditResult<Option<AuditEntryView>> {
        Ok(self
            .store
            .get(&audit_key(local_time))?
            .map(|bytes| read_audit_entry(&bytes)))
    }

    /// Entries with local time strictly after `after` (from the start when
    /// `None`), in local time order
    pub fn scan_after(&self, after: Option<f64>, limit: usize) -> AuditResult<Vec<(f64, AuditEntryView)>> {
        let start_key = after.map(audit_key);
        let start = match &start_key {
            Some(key) => Bound::Excluded(&key[..]),
            None => Bound::Unbounded,
        };
        let end_key = [SENTINEL_PREFIX];
        let items = self.store.get_range(start, Bound::Excluded(&end_key[..]), limit)?;
        Ok(items
            .into_iter()
            .filter_map(|(key, entry)| match parse_audit_key(&key) {
                Some(AuditKey::Time(time)) => Some((time, read_audit_entry(&entry.value))),
                _ => None,
            })
            .collect())
    }

    /// Like `scan_after`, but a cut-off scan is extended until the version of
    /// its last entry is complete. Writes of one transaction share a version
    /// and adjacent local times, so no transaction is split across scans.
    pub fn scan_transactions_after(
        &self,
        after: Option<f64>,
        limit: usize,
    ) -> AuditResult<Vec<(f64, AuditEntryView)>> {
        let mut entries = self.scan_after(after, limit)?;
        let mut full = limit > 0 && entries.len() == limit;
        while full {
            let Some((last_time, last)) = entries.last() else {
                break;
            };
            let version = last.version();
            let more = self.scan_after(Some(*last_time), limit)?;
            full = more.len() == limit;
            for (time, view) in more {
                if view.version() != version {
                    return Ok(entries);
                }
                entries.push((time, view));
            }
        }
        Ok(entries)
    }

    /// Local time of the newest entry
    pub fn latest_local_time(&self) -> AuditResult<Option<f64>> {
        let end_key = [SENTINEL_PREFIX];
        let items = self
            .store
            .get_range_reverse(Bound::Unbounded, Bound::Excluded(&end_key[..]), 1)?;
        Ok(items.first().and_then(|(key, _)| decode_f64(key)))
    }

    /// Bookkeeping value under a sentinel
    pub fn get_sentinel(&self, name: &str) -> AuditResult<Option<Vec<u8>>> {
        Ok(self.store.get(&sentinel_key(name))?)
    }

    /// Persist a bookkeeping value under a sentinel
    pub fn put_sentinel(&self, name: &str, value: Vec<u8>) -> AuditResult<()> {
        Ok(self.store.put(&sentinel_key(name), value, 0.0)?)
    }

    /// Retention watermark
    pub fn last_removed(&self) -> AuditResult<Option<f64>> {
        Ok(self.get_sentinel(LAST_REMOVED)?.and_then(|bytes| decode_f64(&bytes)))
    }

    pub(super) fn set_last_removed(&self, local_time: f64) -> AuditResult<()> {
        self.put_sentinel(LAST_REMOVED, local_time.to_be_bytes().to_vec())
    }

    /// Persisted replication resume time for `peer`
    pub fn resume_time(&self, peer: &str) -> AuditResult<Option<f64>> {
        let name = format!("{}{}", RESUME_PREFIX, peer);
        Ok(self.get_sentinel(&name)?.and_then(|bytes| decode_f64(&bytes)))
    }

    /// Persist the replication resume time for `peer`
    pub fn set_resume_time(&self, peer: &str, local_time: f64) -> AuditResult<()> {
        let name = format!("{}{}", RESUME_PREFIX, peer);
        self.put_sentinel(&name, local_time.to_be_bytes().to_vec())
    }

    /// Register a table's primary store (used to read record values while
    /// collecting blobs and removing tombstones)
    pub fn register_table(&self, table_id: u32, primary: HeaderedStore) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        match tables.get_mut(&table_id) {
            Some(registration) => registration.primary = primary,
            None => {
                tables.insert(
                    table_id,
                    TableRegistration {
                        primary,
                        on_tombstone_removed: None,
                    },
                );
            }
        }
    }

    /// Call `callback` whenever a tombstone of `table_id` is removed because
    /// its delete entry aged out
    pub fn add_delete_removal_callback(
        &self,
        table_id: u32,
        primary: HeaderedStore,
        callback: TombstoneCallback,
    ) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.insert(
            table_id,
            TableRegistration {
                primary,
                on_tombstone_removed: Some(callback),
            },
        );
    }

    /// External storage pressure; retention shrinks to `retention/(1+p²)`
    pub fn set_storage_pressure(&self, priority: f64) {
        *self.pressure.lock().unwrap_or_else(PoisonError::into_inner) = priority.max(0.0);
    }

    /// Entries older than this local time are eligible for removal
    pub fn retention_horizon(&self, now: f64) -> f64 {
        let priority = *self.pressure.lock().unwrap_or_else(PoisonError::into_inner);
        let retention = self.policy.retention_ms as f64 / (1.0 + priority * priority);
        (now - retention).max(0.0)
    }

    /// Remove one entry. Blobs it references that neither the live record nor
    /// a newer entry of that record references are deleted. For a delete
    /// entry, the primary tombstone is removed only if its version still
    /// matches.
    pub fn remove_audit_entry(&self, local_time: f64, view: &AuditEntryView) -> AuditResult<bool> {
        if !view.is_empty() {
            let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(registration) = tables.get(&view.table_id()) {
                if view.has_flag(HAS_BLOBS) {
                    self.collect_blobs(registration, local_time, view)?;
                }
                if view.kind() == Some(ActionKind::Delete) {
                    self.remove_tombstone(registration, view)?;
                }
            }
        }
        Ok(self.store.remove(&audit_key(local_time), None)?)
    }

    fn collect_blobs(
        &self,
        registration: &TableRegistration,
        local_time: f64,
        view: &AuditEntryView,
    ) -> AuditResult<()> {
        let codec = registration.primary.encoder().codec();
        let Some(value) = view.get_value(codec.as_ref(), None)? else {
            return Ok(());
        };
        let referenced = blob_ids(&value);
        if referenced.is_empty() {
            return Ok(());
        }
        let live = match registration.primary.get_entry(view.record_key()) {
            Ok(Some(current)) => current,
            Ok(None) => return self.remove_blobs(&referenced, &HashSet::new()),
            // Undecodable live record: keep its blobs.
            Err(_) => return Ok(()),
        };
        let mut kept = live.value.as_ref().map(blob_ids).unwrap_or_default();

        // Newer entries of the record outlive this one and may still
        // reference the same blobs.
        let mut cursor = live.local_time;
        while let Some(time) = cursor.filter(|time| *time > local_time) {
            let Some(newer) = self.get(time)? else {
                break;
            };
            if newer.is_empty() {
                return Ok(());
            }
            if newer.has_flag(HAS_BLOBS) {
                match newer.get_value(codec.as_ref(), None) {
                    Ok(Some(value)) => kept.extend(blob_ids(&value)),
                    Ok(None) => {}
                    Err(_) => return Ok(()),
                }
            }
            cursor = newer.previous_local_time().filter(|previous| *previous < time);
        }
        self.remove_blobs(&referenced, &kept)
    }

    fn remove_blobs(&self, referenced: &HashSet<String>, kept: &HashSet<String>) -> AuditResult<()> {
        for id in referenced.difference(kept) {
            self.blobs.remove(id.as_bytes(), None)?;
        }
        Ok(())
    }

    fn remove_tombstone(&self, registration: &TableRegistration, view: &AuditEntryView) -> AuditResult<()> {
        let removed = registration
            .primary
            .raw()
            .remove(view.record_key(), Some(view.version()))?;
        if removed {
            let record_id = view.record_id().into_owned();
            let table_id = view.table_id().to_string();
            log_event_with_fields(
                Severity::Trace,
                Event::TombstoneRemoved,
                &[("table", &table_id), ("record", &record_id)],
            );
            if let Some(callback) = &registration.on_tombstone_removed {
                callback(&TombstoneRemoval {
                    table_id: view.table_id(),
                    record_id,
                    version: view.version(),
                });
            }
        }
        Ok(())
    }

    /// Warn (once per store) if the newest audit key is ahead of the wall
    /// clock. Returns true if a regression was detected.
    pub fn check_clock(&self) -> AuditResult<bool> {
        if self.clock_checked.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(latest) = self.latest_local_time()? else {
            return Ok(false);
        };
        let now = wall_clock_ms();
        if latest > now {
            let latest_text = format!("{:.3}", latest);
            let now_text = format!("{:.3}", now);
            log_event_with_fields(
                Severity::Error,
                Event::ClockRegression,
                &[
                    ("env", self.env.path()),
                    ("newest_audit_time", &latest_text),
                    ("wall_clock", &now_text),
                ],
            );
            return Ok(true);
        }
        Ok(false)
    }
}
