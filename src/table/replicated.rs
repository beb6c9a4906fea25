//! Applying changes received from replication peers

use serde_json::{Map, Value};

use super::errors::TableResult;
use super::table::{Staged, StagedRecord, Table, INVALIDATED};
use crate::audit::{ActionKind, AuditEntryView};
use crate::codec::StructureDictionary;
use crate::crdt::{apply_patch, get_record_at_time, rebuild_update_before, CrdtError};
use crate::storage::RecordEntry;
use crate::txn::Transaction;

/// One audit entry received from a peer
#[derive(Debug, Clone)]
pub struct RemoteChange {
    /// The origin's entry (without a previous-time prefix)
    pub entry: AuditEntryView,
    /// Origin node id, already translated to this node's ids
    pub node_id: u32,
    /// The peer's structure dictionary for this table
    pub structures: Option<StructureDictionary>,
}

/// What applying a remote change did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Queued a write
    Applied,
    /// A newer local version wins
    Superseded,
    /// This version is already stored
    Duplicate,
    /// Entry kind is unknown or the entry is empty
    Skipped,
}

fn as_patch(record_id: &str, value: Option<Value>) -> TableResult<Map<String, Value>> {
    match value {
        Some(Value::Object(map)) => Ok(map),
        None => Ok(Map::new()),
        Some(_) => Err(CrdtError::InvalidPatch(record_id.to_string()).into()),
    }
}

impl Table {
    /// Queue a remote change into `txn`. The highest version wins; a stale
    /// patch is rebased under the newer local patches instead of dropped.
    pub fn apply_replicated(&self, txn: &mut Transaction, change: &RemoteChange) -> TableResult<ApplyOutcome> {
        let entry = &change.entry;
        let Some(kind) = entry.kind() else {
            return Ok(ApplyOutcome::Skipped);
        };
        let record_id = entry.record_id().into_owned();
        let payload = entry.get_value(self.codec().as_ref(), change.structures.as_ref())?;
        let version = entry.version();
        // Later local writes must outrank what this node has seen.
        self.env().observe_time(version);

        if kind == ActionKind::Message {
            let staged = self.remote_staged(change, kind, StagedRecord::Untouched, payload);
            self.stage(txn, &record_id, staged)?;
            return Ok(ApplyOutcome::Applied);
        }

        let current = self.entry_in(txn, &record_id)?;
        // Writes of one origin transaction share a version; a queued entry
        // with this version is an earlier write of the same batch.
        let queued = current.as_ref().is_some_and(|current| current.local_time.is_none());
        match current.as_ref().map(|current| current.version) {
            Some(current_version) if current_version == version && !queued => {
                return Ok(ApplyOutcome::Duplicate)
            }
            Some(current_version) if current_version > version => {
                let Some(current) = current else {
                    return Ok(ApplyOutcome::Superseded);
                };
                if kind != ActionKind::Patch {
                    return Ok(ApplyOutcome::Superseded);
                }
                let patch = as_patch(&record_id, payload)?;
                return self.rebase_stale_patch(txn, change, current, patch);
            }
            _ => {}
        }

        let mut staged = match kind {
            ActionKind::Put | ActionKind::Relocate => {
                let record = match &payload {
                    Some(value) => StagedRecord::Value(value.clone()),
                    None => StagedRecord::Tombstone,
                };
                self.remote_staged(change, kind, record, payload)
            }
            ActionKind::Patch => {
                let base = current.and_then(|current| current.value);
                let patch = as_patch(&record_id, payload)?;
                let updated = apply_patch(base.as_ref(), &patch)?;
                let mut staged =
                    self.remote_staged(change, kind, StagedRecord::Value(updated), Some(Value::Object(patch)));
                staged.partial = true;
                staged
            }
            ActionKind::Delete => self.remote_staged(change, kind, StagedRecord::Tombstone, None),
            ActionKind::Invalidate => {
                let mut staged = self.remote_staged(change, kind, StagedRecord::Tombstone, None);
                staged.metadata_flags = INVALIDATED;
                staged
            }
            ActionKind::Message => self.remote_staged(change, kind, StagedRecord::Untouched, payload),
        };
        staged.previous_version = entry.previous_version();
        self.stage(txn, &record_id, staged)?;
        Ok(ApplyOutcome::Applied)
    }

    fn remote_staged(
        &self,
        change: &RemoteChange,
        kind: ActionKind,
        record: StagedRecord,
        payload: Option<Value>,
    ) -> Staged {
        let entry = &change.entry;
        let mut staged = Staged::new(kind, record, entry.version());
        staged.payload = payload;
        staged.node_id = change.node_id;
        staged.current_residency = entry.current_residency();
        staged.previous_residency = entry.previous_residency();
        staged.username = entry.username().map(|name| name.into_owned());
        staged.expires_at = entry.expires_at();
        staged
    }

    /// Apply a patch older than the live record: undo the newer local
    /// entries, apply the old patch, then replay the newer patches. Any newer
    /// put or delete supersedes it.
    fn rebase_stale_patch(
        &self,
        txn: &mut Transaction,
        change: &RemoteChange,
        current: RecordEntry,
        patch: Map<String, Value>,
    ) -> TableResult<ApplyOutcome> {
        let version = change.entry.version();
        if current.local_time.is_none() {
            // The newer write is queued in this batch and has no history yet.
            return Ok(ApplyOutcome::Superseded);
        }
        let mut newer: Vec<AuditEntryView> = Vec::new();
        let mut base_time = None;
        let mut time = current.local_time;
        while let Some(local_time) = time {
            let Some(view) = self.audit_store().get(local_time)?.filter(|view| !view.is_empty()) else {
                // History needed for the rebase is gone.
                return Ok(ApplyOutcome::Superseded);
            };
            if view.version() == version && view.node_id() == change.node_id {
                return Ok(ApplyOutcome::Duplicate);
            }
            if view.version() <= version {
                base_time = Some(local_time);
                break;
            }
            if view.kind() != Some(ActionKind::Patch) {
                return Ok(ApplyOutcome::Superseded);
            }
            time = view.previous_local_time();
            newer.push(view);
        }

        let mut newer_patch = Map::new();
        for view in newer.iter().rev() {
            let next = as_patch(&view.record_id(), view.get_value(self.codec().as_ref(), None)?)?;
            newer_patch = rebuild_update_before(&newer_patch, &next, true)?;
        }
        let combined = rebuild_update_before(&patch, &newer_patch, true)?;

        let before = match base_time {
            Some(target) => get_record_at_time(
                current.value.as_ref(),
                current.local_time,
                target,
                self.audit_store(),
                self.codec().as_ref(),
            )?,
            None => None,
        };
        let updated = apply_patch(before.as_ref(), &combined)?;

        let mut staged = self.remote_staged(
            change,
            ActionKind::Patch,
            StagedRecord::Value(updated),
            Some(Value::Object(patch)),
        );
        staged.partial = true;
        // The record keeps its newer version so later comparisons still see it.
        staged.record_version = current.version;
        staged.metadata_flags = current.metadata_flags;
        self.stage(txn, &change.entry.record_id(), staged)?;
        Ok(ApplyOutcome::Applied)
    }
}
