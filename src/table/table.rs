//! Table write path

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{TableError, TableResult};
use crate::audit::{
    blob_ids, create_audit_entry, ActionKind, AuditEntryView, AuditStore, NewAuditEntry,
    PreviousTime, TombstoneCallback, AUDIT_STORE,
};
use crate::codec::{JsonCodec, StructureDictionary, ValueCodec};
use crate::crdt::{apply_patch, get_record_at_time};
use crate::identity::SELF_NODE_ID;
use crate::storage::{
    AuditWrite, EncodeInstructions, HeaderedStore, RecordEncoder, RecordEntry, StorageEnvironment,
    WriteOp, WriteValue,
};
use crate::txn::Transaction;

/// Record metadata flag: the record was invalidated and must be refetched
pub const INVALIDATED: u8 = 0x02;

const STORE_PREFIX: &str = "records:";

fn default_compact() -> bool {
    true
}

/// Table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    /// Encode objects with the table's structure dictionary
    #[serde(default = "default_compact")]
    pub compact: bool,
}

impl TableDef {
    /// Definition with compact encoding enabled
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compact: true,
        }
    }
}

/// Per-write options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOptions {
    /// Recorded in the audit entry
    pub username: Option<String>,
    /// Record expiration (epoch ms)
    pub expires_at: Option<f64>,
}

pub(super) enum StagedRecord {
    Value(Value),
    Tombstone,
    Untouched,
}

/// One write about to be queued
pub(super) struct Staged {
    pub kind: ActionKind,
    pub record: StagedRecord,
    pub metadata_flags: u8,
    pub payload: Option<Value>,
    pub partial: bool,
    pub node_id: u32,
    /// Version stored with the record
    pub record_version: f64,
    /// Version written into the audit entry
    pub version: f64,
    pub previous_version: Option<f64>,
    pub current_residency: Option<u32>,
    pub previous_residency: Option<u32>,
    pub username: Option<String>,
    pub expires_at: Option<f64>,
}

impl Staged {
    pub(super) fn new(kind: ActionKind, record: StagedRecord, version: f64) -> Self {
        Self {
            kind,
            record,
            metadata_flags: 0,
            payload: None,
            partial: false,
            node_id: SELF_NODE_ID,
            record_version: version,
            version,
            previous_version: None,
            current_residency: None,
            previous_residency: None,
            username: None,
            expires_at: None,
        }
    }

    fn with_options(mut self, options: &WriteOptions) -> Self {
        self.username = options.username.clone();
        self.expires_at = options.expires_at;
        self
    }
}

fn record_key(id: &str) -> TableResult<&[u8]> {
    if id.is_empty() {
        return Err(TableError::InvalidRecordId(id.to_string()));
    }
    Ok(id.as_bytes())
}

/// A table: primary store plus its audit store
pub struct Table {
    name: String,
    id: u32,
    store_name: String,
    env: Arc<dyn StorageEnvironment>,
    audit: Arc<AuditStore>,
    primary: HeaderedStore,
    codec: Arc<JsonCodec>,
}

impl Table {
    pub(super) fn open(
        def: TableDef,
        id: u32,
        env: Arc<dyn StorageEnvironment>,
        audit: Arc<AuditStore>,
    ) -> TableResult<Self> {
        let store_name = format!("{}{}", STORE_PREFIX, def.name);
        let (raw, _) = env.open_store(&store_name)?;
        let codec = Arc::new(if def.compact {
            JsonCodec::compact()
        } else {
            JsonCodec::new()
        });
        let primary = HeaderedStore::new(raw, RecordEncoder::new(codec.clone()));
        Ok(Self {
            name: def.name,
            id,
            store_name,
            env,
            audit,
            primary,
            codec,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id used for this table in audit entries
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Primary store
    pub fn primary_store(&self) -> &HeaderedStore {
        &self.primary
    }

    /// Audit store shared with every table of the database
    pub fn audit_store(&self) -> &Arc<AuditStore> {
        &self.audit
    }

    pub fn env(&self) -> &Arc<dyn StorageEnvironment> {
        &self.env
    }

    /// Structural codec
    pub fn codec(&self) -> &Arc<JsonCodec> {
        &self.codec
    }

    /// Snapshot of the structure dictionary (sent to replication peers)
    pub fn structures(&self) -> StructureDictionary {
        self.codec.dictionary()
    }

    /// Call `callback` when a tombstone of this table is removed by audit
    /// retention
    pub fn on_tombstone_removed(&self, callback: TombstoneCallback) {
        self.audit
            .add_delete_removal_callback(self.id, self.primary.clone(), callback);
    }

    // ========== Reads ==========

    /// Live entry, read outside any transaction
    pub fn get_entry(&self, id: &str) -> TableResult<Option<RecordEntry>> {
        let key = record_key(id)?;
        let _read = self.env.begin_read();
        Ok(self.primary.get_entry(key)?)
    }

    /// Live value, read outside any transaction. Tombstones and invalidated
    /// records read as `None`.
    pub fn get_value(&self, id: &str) -> TableResult<Option<Value>> {
        Ok(self.get_entry(id)?.and_then(visible_value))
    }

    /// Read a record inside `txn`; a tracked transaction will only commit if
    /// the record is unchanged at commit time. Writes already queued in
    /// `txn` are visible.
    pub fn get(&self, txn: &mut Transaction, id: &str) -> TableResult<Option<Value>> {
        Ok(self.entry_in(txn, id)?.and_then(visible_value))
    }

    /// Entry as `txn` sees it: its own latest queued write to `id`, else the
    /// committed entry, recorded as a read condition. A queued entry has no
    /// local time yet.
    pub(super) fn entry_in(&self, txn: &mut Transaction, id: &str) -> TableResult<Option<RecordEntry>> {
        let key = record_key(id)?;
        if let Some(op) = txn.pending_write(&self.env, &self.store_name, key) {
            let WriteValue::Put(bytes) = &op.value else {
                return Ok(None);
            };
            let decoded = self.primary.encoder().decode(bytes)?;
            return Ok(Some(RecordEntry {
                value: decoded.value,
                version: op.version,
                local_time: decoded.header.local_time,
                metadata_flags: decoded.header.metadata_flags,
                expires_at: decoded.header.expires_at,
            }));
        }
        let entry = self.get_entry(id)?;
        txn.record_read(
            &self.env,
            &self.store_name,
            key,
            entry.as_ref().map(|entry| entry.version),
        );
        Ok(entry)
    }

    // ========== Writes ==========

    /// Replace a record
    pub fn put(
        &self,
        txn: &mut Transaction,
        id: &str,
        value: Value,
        options: &WriteOptions,
    ) -> TableResult<()> {
        let mut staged = Staged::new(ActionKind::Put, StagedRecord::Value(value.clone()), txn.version())
            .with_options(options);
        staged.payload = Some(value);
        self.stage(txn, id, staged)
    }

    /// Apply a patch (`null` clears a field, `{"__op__":"add"}` adds). The
    /// current record is read inside `txn`.
    pub fn patch(
        &self,
        txn: &mut Transaction,
        id: &str,
        patch: Map<String, Value>,
        options: &WriteOptions,
    ) -> TableResult<()> {
        let current = self.get(txn, id)?;
        let updated = apply_patch(current.as_ref(), &patch)?;
        let mut staged = Staged::new(ActionKind::Patch, StagedRecord::Value(updated), txn.version())
            .with_options(options);
        staged.payload = Some(Value::Object(patch));
        staged.partial = true;
        self.stage(txn, id, staged)
    }

    /// Delete a record, leaving a tombstone until its audit entry ages out
    pub fn delete(&self, txn: &mut Transaction, id: &str, options: &WriteOptions) -> TableResult<()> {
        let staged =
            Staged::new(ActionKind::Delete, StagedRecord::Tombstone, txn.version()).with_options(options);
        self.stage(txn, id, staged)
    }

    /// Publish a message on a record's topic without changing the record
    pub fn publish(
        &self,
        txn: &mut Transaction,
        id: &str,
        message: Value,
        options: &WriteOptions,
    ) -> TableResult<()> {
        let mut staged = Staged::new(ActionKind::Message, StagedRecord::Untouched, txn.version())
            .with_options(options);
        staged.payload = Some(message);
        self.stage(txn, id, staged)
    }

    /// Mark a record invalidated: its value is dropped and reads return
    /// `None` until it is written again
    pub fn invalidate(&self, txn: &mut Transaction, id: &str, options: &WriteOptions) -> TableResult<()> {
        let mut staged = Staged::new(ActionKind::Invalidate, StagedRecord::Tombstone, txn.version())
            .with_options(options);
        staged.metadata_flags = INVALIDATED;
        self.stage(txn, id, staged)
    }

    /// Move a record to another residency, keeping its value
    pub fn relocate(
        &self,
        txn: &mut Transaction,
        id: &str,
        residency: u32,
        options: &WriteOptions,
    ) -> TableResult<()> {
        let entry = self.entry_in(txn, id)?;
        let previous_residency = match entry.as_ref().and_then(|entry| entry.local_time) {
            Some(local_time) => self
                .audit
                .get(local_time)?
                .and_then(|view| view.current_residency()),
            None => None,
        };
        let record = match entry.and_then(|entry| entry.value) {
            Some(value) => StagedRecord::Value(value),
            None => StagedRecord::Tombstone,
        };
        let mut staged = Staged::new(ActionKind::Relocate, record, txn.version()).with_options(options);
        if let StagedRecord::Value(value) = &staged.record {
            staged.payload = Some(value.clone());
        }
        staged.current_residency = Some(residency);
        staged.previous_residency = previous_residency;
        self.stage(txn, id, staged)
    }

    pub(super) fn stage(&self, txn: &mut Transaction, id: &str, staged: Staged) -> TableResult<()> {
        let key = record_key(id)?.to_vec();
        let instructions = EncodeInstructions {
            assign_timestamp: true,
            local_time: None,
            metadata_flags: staged.metadata_flags,
            expires_at: staged.expires_at,
        };
        let value = match &staged.record {
            StagedRecord::Value(value) => WriteValue::Put(self.primary.encoder().encode(Some(value), &instructions)?),
            StagedRecord::Tombstone => WriteValue::Put(self.primary.encoder().encode(None, &instructions)?),
            StagedRecord::Untouched => WriteValue::AuditOnly,
        };
        let has_blobs = staged
            .payload
            .as_ref()
            .is_some_and(|payload| !blob_ids(payload).is_empty());
        let previous_local_time = match staged.record {
            StagedRecord::Untouched => PreviousTime::None,
            _ => PreviousTime::FillAtCommit,
        };
        let entry = create_audit_entry(&NewAuditEntry {
            kind: staged.kind,
            node_id: staged.node_id,
            table_id: self.id,
            record_id: id.to_string(),
            version: staged.version,
            previous_local_time,
            previous_version: staged.previous_version,
            current_residency: staged.current_residency,
            previous_residency: staged.previous_residency,
            expires_at: staged.expires_at,
            originating_operation: None,
            extended_type: None,
            username: staged.username,
            value: staged.payload.as_ref().map(|payload| self.codec.encode(payload)),
            partial: staged.partial,
            has_blobs,
        })?;
        txn.queue_write(
            &self.env,
            WriteOp {
                store: self.store_name.clone(),
                key,
                value,
                version: staged.record_version,
                audit: Some(AuditWrite {
                    store: AUDIT_STORE.to_string(),
                    entry,
                }),
            },
        );
        Ok(())
    }

    // ========== History ==========

    /// A record's audit chain, newest first
    pub fn history(&self, id: &str) -> TableResult<Vec<(f64, AuditEntryView)>> {
        let mut chain = Vec::new();
        let mut time = self.get_entry(id)?.and_then(|entry| entry.local_time);
        while let Some(local_time) = time {
            let Some(view) = self.audit.get(local_time)?.filter(|view| !view.is_empty()) else {
                break;
            };
            time = view.previous_local_time();
            chain.push((local_time, view));
        }
        Ok(chain)
    }

    /// The record as it was at local time `target`
    pub fn record_at(&self, id: &str, target: f64) -> TableResult<Option<Value>> {
        let entry = self.get_entry(id)?;
        let (value, local_time) = match entry {
            Some(entry) => (entry.value, entry.local_time),
            None => (None, None),
        };
        Ok(get_record_at_time(
            value.as_ref(),
            local_time,
            target,
            &self.audit,
            self.codec.as_ref(),
        )?)
    }

    /// Value carried by the audit entry at `local_time`. With `full`, a
    /// patch entry resolves to the whole record as of that entry.
    pub fn entry_value(
        &self,
        local_time: f64,
        view: &AuditEntryView,
        full: bool,
    ) -> TableResult<Option<Value>> {
        if !full || !view.has_partial_record() {
            return Ok(view.get_value(self.codec.as_ref(), None)?);
        }
        self.record_at(&view.record_id(), local_time)
    }
}

fn visible_value(entry: RecordEntry) -> Option<Value> {
    if entry.metadata_flags & INVALIDATED != 0 {
        return None;
    }
    entry.value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RetentionPolicy;
    use crate::crdt::add_op;
    use crate::table::Database;
    use crate::txn::Isolation;
    use serde_json::json;

    fn setup() -> (Arc<Database>, Arc<Table>) {
        let db = Database::in_memory("app", RetentionPolicy::default()).unwrap();
        let table = db.table(TableDef::new("items")).unwrap();
        (db, table)
    }

    fn run(db: &Database, op: impl FnOnce(&mut Transaction) -> TableResult<()>) {
        let mut txn = db.begin(Isolation::Tracked);
        op(&mut txn).unwrap();
        assert!(txn.commit().unwrap());
    }

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_put_then_get() {
        let (db, table) = setup();
        run(&db, |txn| table.put(txn, "a", json!({"name": "x", "n": 1}), &WriteOptions::default()));
        assert_eq!(table.get_value("a").unwrap(), Some(json!({"name": "x", "n": 1})));
        let entry = table.get_entry("a").unwrap().unwrap();
        assert!(entry.local_time.is_some());
    }

    #[test]
    fn test_audit_chain_links_previous_writes() {
        let (db, table) = setup();
        run(&db, |txn| table.put(txn, "a", json!({"n": 1}), &WriteOptions::default()));
        run(&db, |txn| table.patch(txn, "a", obj(json!({"n": add_op(json!(2))})), &WriteOptions::default()));
        run(&db, |txn| table.delete(txn, "a", &WriteOptions::default()));

        let history = table.history("a").unwrap();
        let kinds: Vec<_> = history.iter().map(|(_, view)| view.kind()).collect();
        assert_eq!(
            kinds,
            vec![Some(ActionKind::Delete), Some(ActionKind::Patch), Some(ActionKind::Put)]
        );
        assert_eq!(history[0].1.previous_local_time(), Some(history[1].0));
        assert_eq!(history[2].1.previous_local_time(), None);
        assert_eq!(table.get_value("a").unwrap(), None);
    }

    #[test]
    fn test_patch_adds() {
        let (db, table) = setup();
        run(&db, |txn| table.put(txn, "c", json!({"count": 1, "label": "x"}), &WriteOptions::default()));
        run(&db, |txn| table.patch(txn, "c", obj(json!({"count": add_op(json!(4))})), &WriteOptions::default()));
        assert_eq!(table.get_value("c").unwrap(), Some(json!({"count": 5, "label": "x"})));
    }

    #[test]
    fn test_record_at_and_entry_value() {
        let (db, table) = setup();
        run(&db, |txn| table.put(txn, "c", json!({"count": 1, "label": "x"}), &WriteOptions::default()));
        run(&db, |txn| table.patch(txn, "c", obj(json!({"count": add_op(json!(4))})), &WriteOptions::default()));
        run(&db, |txn| table.patch(txn, "c", obj(json!({"count": add_op(json!(10))})), &WriteOptions::default()));

        let history = table.history("c").unwrap();
        let (middle_time, middle) = &history[1];
        assert_eq!(
            table.record_at("c", *middle_time).unwrap(),
            Some(json!({"count": 5, "label": "x"}))
        );
        assert_eq!(
            table.entry_value(*middle_time, middle, false).unwrap(),
            Some(json!({"count": add_op(json!(4))}))
        );
        assert_eq!(
            table.entry_value(*middle_time, middle, true).unwrap(),
            Some(json!({"count": 5, "label": "x"}))
        );
    }

    #[test]
    fn test_reads_see_queued_writes() {
        let (db, table) = setup();
        run(&db, |txn| table.put(txn, "gone", json!({"v": 0}), &WriteOptions::default()));
        run(&db, |txn| {
            table.put(txn, "a", json!({"x": 1}), &WriteOptions::default())?;
            assert_eq!(table.get(txn, "a")?, Some(json!({"x": 1})));
            table.patch(txn, "a", obj(json!({"y": 2})), &WriteOptions::default())?;
            table.patch(txn, "a", obj(json!({"y": add_op(json!(3))})), &WriteOptions::default())?;

            table.delete(txn, "gone", &WriteOptions::default())?;
            assert_eq!(table.get(txn, "gone")?, None);
            Ok(())
        });

        assert_eq!(table.get_value("a").unwrap(), Some(json!({"x": 1, "y": 5})));
        assert_eq!(table.get_value("gone").unwrap(), None);
        let kinds: Vec<_> = table
            .history("a")
            .unwrap()
            .iter()
            .map(|(_, view)| view.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![Some(ActionKind::Patch), Some(ActionKind::Patch), Some(ActionKind::Put)]
        );
    }

    #[test]
    fn test_publish_leaves_record_untouched() {
        let (db, table) = setup();
        run(&db, |txn| table.put(txn, "topic", json!({"v": 1}), &WriteOptions::default()));
        let before = table.get_entry("topic").unwrap().unwrap();
        run(&db, |txn| table.publish(txn, "topic", json!("hello"), &WriteOptions::default()));
        let after = table.get_entry("topic").unwrap().unwrap();
        assert_eq!(before, after);

        let latest = db.audit_store().latest_local_time().unwrap().unwrap();
        let view = db.audit_store().get(latest).unwrap().unwrap();
        assert_eq!(view.kind(), Some(ActionKind::Message));
        assert_eq!(view.previous_local_time(), None);
    }

    #[test]
    fn test_invalidate_hides_value() {
        let (db, table) = setup();
        run(&db, |txn| table.put(txn, "a", json!({"v": 1}), &WriteOptions::default()));
        run(&db, |txn| table.invalidate(txn, "a", &WriteOptions::default()));
        assert_eq!(table.get_value("a").unwrap(), None);
        let entry = table.get_entry("a").unwrap().unwrap();
        assert_eq!(entry.metadata_flags & INVALIDATED, INVALIDATED);
    }

    #[test]
    fn test_relocate_records_residencies() {
        let (db, table) = setup();
        run(&db, |txn| table.put(txn, "a", json!({"v": 1}), &WriteOptions::default()));
        run(&db, |txn| table.relocate(txn, "a", 3, &WriteOptions::default()));
        run(&db, |txn| table.relocate(txn, "a", 4, &WriteOptions::default()));
        let history = table.history("a").unwrap();
        assert_eq!(history[0].1.current_residency(), Some(4));
        assert_eq!(history[0].1.previous_residency(), Some(3));
        assert_eq!(table.get_value("a").unwrap(), Some(json!({"v": 1})));
    }

    #[test]
    fn test_username_and_expiration_recorded() {
        let (db, table) = setup();
        let options = WriteOptions {
            username: Some("ada".to_string()),
            expires_at: Some(1_900_000_000_000.0),
        };
        run(&db, |txn| table.put(txn, "a", json!({"v": 1}), &options));
        let entry = table.get_entry("a").unwrap().unwrap();
        assert_eq!(entry.expires_at, Some(1_900_000_000_000.0));
        let history = table.history("a").unwrap();
        let view = &history[0].1;
        assert_eq!(view.username().as_deref(), Some("ada"));
        assert_eq!(view.expires_at(), Some(1_900_000_000_000.0));
    }

    #[test]
    fn test_empty_record_id_rejected() {
        let (db, table) = setup();
        let mut txn = db.begin(Isolation::Tracked);
        let err = table.put(&mut txn, "", json!(1), &WriteOptions::default()).unwrap_err();
        assert!(matches!(err, TableError::InvalidRecordId(_)));
    }
}
