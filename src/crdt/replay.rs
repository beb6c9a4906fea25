//! Historical record reconstruction
//!
//! Walks a record's audit chain backwards from its live value. Entries newer
//! than the target are undone: patch adds are reversed by subtraction, other
//! patched fields become unknown, and puts, deletes or invalidations make
//! the whole record unknown. Unknown fields are then resolved from older
//! entries, even ones past the target. Fields the chain cannot resolve read
//! as absent.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use super::errors::{CrdtError, CrdtResult};
use super::ops::{add_values, apply_patch, negate, parse_patch, FieldUpdate};
use crate::audit::{ActionKind, AuditEntryView, AuditStore};
use crate::codec::ValueCodec;

/// How a walk ended without a full resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainEnd {
    /// Reached the record's first write: missing fields were absent
    FirstWrite,
    /// An entry is gone (retention) or unreadable: older state is unknown
    Broken,
}

#[derive(Debug, Default)]
struct WorkingRecord {
    /// Known fields; `None` is known-absent
    fields: BTreeMap<String, Option<Value>>,
    /// Fields whose value is not known
    unknown: BTreeSet<String>,
    /// Every field not in `fields` is unknown
    open: bool,
    /// Numeric deltas to apply once an unknown field resolves
    adjust: BTreeMap<String, Value>,
    /// A put resolved the record to a non-object value
    whole: Option<Value>,
}

impl WorkingRecord {
    fn from_value(value: Option<&Value>) -> Self {
        let mut working = Self::default();
        match value {
            Some(Value::Object(map)) => {
                for (field, value) in map {
                    working.fields.insert(field.clone(), Some(value.clone()));
                }
            }
            Some(other) => working.whole = Some(other.clone()),
            None => {}
        }
        working
    }

    fn is_unresolved(&self, field: &str) -> bool {
        self.unknown.contains(field) || (self.open && !self.fields.contains_key(field))
    }

    fn is_complete(&self) -> bool {
        !self.open && self.unknown.is_empty()
    }

    fn add_adjustment(&mut self, field: &str, delta: &Value) -> CrdtResult<()> {
        let current = self.adjust.get(field).cloned().unwrap_or(Value::Null);
        let sum = add_values(field, &current, delta)?;
        self.adjust.insert(field.to_string(), sum);
        Ok(())
    }

    fn undo_patch(&mut self, patch: &Map<String, Value>) -> CrdtResult<()> {
        self.whole = None;
        for (field, update) in parse_patch(patch)? {
            match update {
                // An unknown field is resolved from entries at or before the
                // target, so there is nothing to reverse.
                FieldUpdate::Add(_) if self.is_unresolved(&field) => {}
                FieldUpdate::Add(operand) => {
                    let reverse = negate(&field, &operand)?;
                    let current = self.fields.get(&field).cloned().flatten().unwrap_or(Value::Null);
                    let value = add_values(&field, &current, &reverse)?;
                    self.fields.insert(field, Some(value));
                }
                FieldUpdate::Set(_) => {
                    self.fields.remove(&field);
                    self.adjust.remove(&field);
                    self.unknown.insert(field);
                }
            }
        }
        Ok(())
    }

    fn undo_whole(&mut self) {
        *self = WorkingRecord {
            open: true,
            ..WorkingRecord::default()
        };
    }

    fn resolve(&mut self, field: &str, value: Value) -> CrdtResult<()> {
        let value = match self.adjust.remove(field) {
            Some(delta) => add_values(field, &value, &delta)?,
            None => value,
        };
        self.unknown.remove(field);
        let value = if value.is_null() { None } else { Some(value) };
        self.fields.insert(field.to_string(), value);
        Ok(())
    }

    fn resolve_patch(&mut self, patch: &Map<String, Value>) -> CrdtResult<()> {
        for (field, update) in parse_patch(patch)? {
            if !self.is_unresolved(&field) {
                continue;
            }
            match update {
                FieldUpdate::Set(value) => self.resolve(&field, value)?,
                FieldUpdate::Add(operand) => self.add_adjustment(&field, &operand)?,
            }
        }
        Ok(())
    }

    fn resolve_put(&mut self, value: Option<Value>) -> CrdtResult<()> {
        match value {
            Some(Value::Object(map)) => {
                for (field, value) in map {
                    if self.is_unresolved(&field) {
                        self.resolve(&field, value)?;
                    }
                }
            }
            Some(other) if self.open && self.fields.is_empty() => {
                self.whole = Some(other);
            }
            _ => {}
        }
        self.finish(ChainEnd::FirstWrite);
        Ok(())
    }

    /// Settle every unresolved field. Past a first write (or a put/delete,
    /// which fix the full state) a missing field was absent, so pending adds
    /// are its value. Past a broken chain nothing is known.
    fn finish(&mut self, end: ChainEnd) {
        let mut pending: BTreeSet<String> = std::mem::take(&mut self.unknown);
        if self.open {
            pending.extend(self.adjust.keys().filter(|f| !self.fields.contains_key(*f)).cloned());
        }
        for field in pending {
            let value = match end {
                ChainEnd::FirstWrite => self.adjust.remove(&field),
                ChainEnd::Broken => None,
            };
            self.fields.insert(field, value);
        }
        self.adjust.clear();
        self.open = false;
    }

    fn build(self) -> Value {
        if let Some(whole) = self.whole {
            return whole;
        }
        let map: Map<String, Value> = self
            .fields
            .into_iter()
            .filter_map(|(field, value)| value.map(|v| (field, v)))
            .collect();
        Value::Object(map)
    }
}

fn patch_of(entry: &AuditEntryView, codec: &dyn ValueCodec) -> CrdtResult<Map<String, Value>> {
    match entry.get_value(codec, None)? {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(CrdtError::InvalidPatch(entry.record_id().into_owned())),
        None => Ok(Map::new()),
    }
}

fn fetch(audit: &AuditStore, local_time: f64) -> CrdtResult<Option<AuditEntryView>> {
    Ok(audit.get(local_time)?.filter(|entry| !entry.is_empty()))
}

/// State of a record at `target`, given its live value and local time.
/// `None` means the record did not exist (or was deleted) at that time.
pub fn get_record_at_time(
    current: Option<&Value>,
    current_local_time: Option<f64>,
    target: f64,
    audit: &AuditStore,
    codec: &dyn ValueCodec,
) -> CrdtResult<Option<Value>> {
    let Some(mut time) = current_local_time else {
        return Ok(current.cloned());
    };
    if time <= target {
        return Ok(current.cloned());
    }

    let mut working = WorkingRecord::from_value(current);

    // Undo everything newer than the target.
    while time > target {
        let Some(entry) = fetch(audit, time)? else {
            working.finish(ChainEnd::Broken);
            return Ok(Some(working.build()));
        };
        match entry.kind() {
            Some(ActionKind::Patch) => working.undo_patch(&patch_of(&entry, codec)?)?,
            Some(ActionKind::Put) | Some(ActionKind::Delete) | Some(ActionKind::Invalidate) => {
                working.undo_whole()
            }
            // A relocation keeps the value it moves.
            _ => {}
        }
        match entry.previous_local_time() {
            Some(previous) => time = previous,
            // The oldest write is newer than the target.
            None => return Ok(None),
        }
    }

    // Resolve what is unknown from the target backwards.
    let mut head = true;
    loop {
        if !head && working.is_complete() {
            break;
        }
        let Some(entry) = fetch(audit, time)? else {
            working.finish(ChainEnd::Broken);
            break;
        };
        match entry.kind() {
            Some(ActionKind::Put) | Some(ActionKind::Relocate) => {
                let value = entry.get_value(codec, None)?;
                if head && value.is_none() {
                    // Relocated tombstone
                    return Ok(None);
                }
                working.resolve_put(value)?;
                break;
            }
            Some(ActionKind::Delete) | Some(ActionKind::Invalidate) => {
                if head {
                    return Ok(None);
                }
                working.finish(ChainEnd::FirstWrite);
                break;
            }
            Some(ActionKind::Patch) => working.resolve_patch(&patch_of(&entry, codec)?)?,
            _ => {}
        }
        head = false;
        match entry.previous_local_time() {
            Some(previous) => time = previous,
            None => {
                working.finish(ChainEnd::FirstWrite);
                break;
            }
        }
    }

    Ok(Some(working.build()))
}

/// Replay a record's chain forward from its first write up to `latest`
pub fn replay_chain(audit: &AuditStore, codec: &dyn ValueCodec, latest: f64) -> CrdtResult<Option<Value>> {
    let mut chain = Vec::new();
    let mut time = Some(latest);
    while let Some(local_time) = time {
        let Some(entry) = fetch(audit, local_time)? else {
            break;
        };
        time = entry.previous_local_time();
        chain.push(entry);
    }

    let mut value: Option<Value> = None;
    for entry in chain.iter().rev() {
        match entry.kind() {
            Some(ActionKind::Put) | Some(ActionKind::Relocate) => value = entry.get_value(codec, None)?,
            Some(ActionKind::Delete) | Some(ActionKind::Invalidate) => value = None,
            Some(ActionKind::Patch) => {
                value = Some(apply_patch(value.as_ref(), &patch_of(entry, codec)?)?);
            }
            _ => {}
        }
    }
    Ok(value)
}
