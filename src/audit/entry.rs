//! Audit entry binary codec
//!
//! One audit entry describes one mutation:
//!
//! ```text
//! +--------------------------------+
//! | Previous local time (8 bytes)  |  optional: f64 BE (first byte 66) or fill-at-commit placeholder
//! +--------------------------------+
//! | Action (varint)                |  kind (1..6) | flags
//! | Node id (varint)               |
//! | Table id (varint)              |
//! | Record id (varint len + UTF-8) |
//! | Version (f64 BE)               |
//! | Optional fields per flags      |
//! | Username (1 or 2 byte len)     |
//! +--------------------------------+
//! | Value bytes                    |  remaining bytes
//! +--------------------------------+
//! ```
//!
//! Readers must tolerate corrupt entries: `read_audit_entry` logs and returns
//! an empty view so a range scan can continue.

use std::borrow::Cow;

use serde_json::Value;

use super::errors::{AuditError, AuditResult};
use crate::codec::{StructureDictionary, ValueCodec};
use crate::observability::{hex_prefix, log_event_with_fields, Event, Severity};
use crate::storage::LITERAL_TIMESTAMP_BYTE;

/// Placeholder prefix the storage engine replaces with the record's
/// previous local time at commit (a NaN bit pattern; never a valid action)
pub const PREVIOUS_TIME_PLACEHOLDER: [u8; 8] = [0x7f, 0xf8, 0, 0, 0, 0, 0, 1];

/// Mask selecting the action kind from the action code
pub const KIND_MASK: u32 = 0x0f;
/// Full record value embedded
pub const HAS_RECORD: u32 = 16;
/// Patch (partial record) embedded
pub const HAS_PARTIAL_RECORD: u32 = 32;
/// Previous version field present
pub const HAS_PREVIOUS_VERSION: u32 = 64;
/// Extended type field present
pub const HAS_EXTENDED_TYPE: u32 = 128;
/// Current residency id present
pub const HAS_CURRENT_RESIDENCY_ID: u32 = 512;
/// Previous residency id present
pub const HAS_PREVIOUS_RESIDENCY_ID: u32 = 1024;
/// Originating operation present
pub const HAS_ORIGINATING_OPERATION: u32 = 2048;
/// Expiration present
pub const HAS_EXPIRATION_EXTENDED_TYPE: u32 = 0x1000;
/// Value references blobs
pub const HAS_BLOBS: u32 = 0x2000;

const HEX_DUMP_BYTES: usize = 16;
const MAX_SHORT_USERNAME: usize = 0x7f;
const MAX_USERNAME: usize = 0x7fff;

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ActionKind {
    /// Full record write
    #[default]
    Put = 1,
    /// Record deletion (tombstone)
    Delete = 2,
    /// Message published to a record without changing it
    Message = 3,
    /// Cached record invalidated
    Invalidate = 4,
    /// Partial update
    Patch = 5,
    /// Record moved between residencies
    Relocate = 6,
}

impl ActionKind {
    /// Convert from the low bits of an action code
    pub fn from_code(code: u32) -> Option<Self> {
        match code & KIND_MASK {
            1 => Some(ActionKind::Put),
            2 => Some(ActionKind::Delete),
            3 => Some(ActionKind::Message),
            4 => Some(ActionKind::Invalidate),
            5 => Some(ActionKind::Patch),
            6 => Some(ActionKind::Relocate),
            _ => None,
        }
    }

    /// Numeric kind
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Put => "put",
            ActionKind::Delete => "delete",
            ActionKind::Message => "message",
            ActionKind::Invalidate => "invalidate",
            ActionKind::Patch => "patch",
            ActionKind::Relocate => "relocate",
        }
    }
}

// ========== Variable-length integers ==========

/// Encoded size of `value`
pub fn varint_len(value: u32) -> usize {
    if value < 0x80 {
        1
    } else if value < 0x4000 {
        2
    } else if value < 0x3f00_0000 {
        4
    } else {
        5
    }
}

/// Append `value` as a varint
pub fn write_varint(out: &mut Vec<u8>, value: u32) {
    match varint_len(value) {
        1 => out.push(value as u8),
        2 => out.extend_from_slice(&((value as u16) | 0x8000).to_be_bytes()),
        4 => out.extend_from_slice(&(value | 0xc000_0000).to_be_bytes()),
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

/// Read a varint at `*position`, advancing it
pub fn read_varint(buffer: &[u8], position: &mut usize) -> AuditResult<u32> {
    let start = *position;
    let first = *buffer
        .get(start)
        .ok_or_else(|| decode_error("truncated varint", buffer))?;
    let (value, len) = if first < 0x80 {
        (first as u32, 1)
    } else if first & 0xc0 == 0x80 {
        let bytes = slice(buffer, start, 2)?;
        ((u16::from_be_bytes([bytes[0], bytes[1]]) & 0x3fff) as u32, 2)
    } else if first == 0xff {
        let bytes = slice(buffer, start + 1, 4)?;
        (u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 5)
    } else {
        let bytes = slice(buffer, start, 4)?;
        (
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x3fff_ffff,
            4,
        )
    };
    *position = start + len;
    Ok(value)
}

fn write_action(out: &mut Vec<u8>, action: u32) {
    if action == LITERAL_TIMESTAMP_BYTE as u32 {
        // Force the wide form so a leading 66 always means a time prefix.
        out.extend_from_slice(&((action as u16) | 0x8000).to_be_bytes());
    } else {
        write_varint(out, action);
    }
}

fn slice(buffer: &[u8], start: usize, len: usize) -> AuditResult<&[u8]> {
    buffer
        .get(start..start + len)
        .ok_or_else(|| decode_error("truncated entry", buffer))
}

fn read_f64(buffer: &[u8], position: &mut usize) -> AuditResult<f64> {
    let bytes = slice(buffer, *position, 8)?;
    *position += 8;
    let mut array = [0u8; 8];
    array.copy_from_slice(bytes);
    Ok(f64::from_be_bytes(array))
}

fn decode_error(reason: impl Into<String>, buffer: &[u8]) -> AuditError {
    AuditError::Decode {
        reason: reason.into(),
        hex: hex_prefix(buffer, HEX_DUMP_BYTES),
    }
}

// ========== Composition ==========

/// Previous-local-time back-pointer of a new entry
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PreviousTime {
    /// First write of the record
    #[default]
    None,
    /// Known previous local time
    At(f64),
    /// Filled by the storage engine at commit
    FillAtCommit,
}

/// Fields of an audit entry to be written
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewAuditEntry {
    pub kind: ActionKind,
    pub node_id: u32,
    pub table_id: u32,
    pub record_id: String,
    pub version: f64,
    pub previous_local_time: PreviousTime,
    pub previous_version: Option<f64>,
    pub current_residency: Option<u32>,
    pub previous_residency: Option<u32>,
    pub expires_at: Option<f64>,
    pub originating_operation: Option<u32>,
    pub extended_type: Option<u32>,
    pub username: Option<String>,
    /// Encoded value (full record, or patch when `partial`)
    pub value: Option<Vec<u8>>,
    /// `value` is a patch rather than a full record
    pub partial: bool,
    /// `value` references blobs
    pub has_blobs: bool,
}

impl NewAuditEntry {
    /// Action code: kind plus flags
    pub fn action_code(&self) -> u32 {
        let mut action = self.kind.as_u32();
        if self.value.is_some() {
            action |= if self.partial {
                HAS_PARTIAL_RECORD
            } else {
                HAS_RECORD
            };
        }
        if self.previous_version.is_some() {
            action |= HAS_PREVIOUS_VERSION;
        }
        if self.extended_type.is_some() {
            action |= HAS_EXTENDED_TYPE;
        }
        if self.current_residency.is_some() {
            action |= HAS_CURRENT_RESIDENCY_ID;
        }
        if self.previous_residency.is_some() {
            action |= HAS_PREVIOUS_RESIDENCY_ID;
        }
        if self.originating_operation.is_some() {
            action |= HAS_ORIGINATING_OPERATION;
        }
        if self.expires_at.is_some() {
            action |= HAS_EXPIRATION_EXTENDED_TYPE;
        }
        if self.has_blobs {
            action |= HAS_BLOBS;
        }
        action
    }
}

/// Reusable audit entry encoder. Holding it by `&mut` makes each compose
/// step exclusive; the returned buffer is an independent copy.
#[derive(Debug, Default)]
pub struct AuditEntryComposer {
    scratch: Vec<u8>,
}

impl AuditEntryComposer {
    /// Create a composer with an empty scratch buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `entry` and return a trimmed copy with the value appended
    pub fn compose(&mut self, entry: &NewAuditEntry) -> AuditResult<Vec<u8>> {
        self.scratch.clear();
        let out = &mut self.scratch;

        match entry.previous_local_time {
            PreviousTime::None => {}
            PreviousTime::FillAtCommit => out.extend_from_slice(&PREVIOUS_TIME_PLACEHOLDER),
            PreviousTime::At(time) => {
                let bytes = time.to_be_bytes();
                if bytes[0] != LITERAL_TIMESTAMP_BYTE {
                    return Err(AuditError::Encode(format!(
                        "previous local time {} is not a literal timestamp",
                        time
                    )));
                }
                out.extend_from_slice(&bytes);
            }
        }

        write_action(out, entry.action_code());
        write_varint(out, entry.node_id);
        write_varint(out, entry.table_id);

        let record_id = entry.record_id.as_bytes();
        let record_id_len = u32::try_from(record_id.len())
            .map_err(|_| AuditError::Encode("record id too long".to_string()))?;
        write_varint(out, record_id_len);
        out.extend_from_slice(record_id);
        out.extend_from_slice(&entry.version.to_be_bytes());

        if let Some(previous_version) = entry.previous_version {
            out.extend_from_slice(&previous_version.to_be_bytes());
        }
        if let Some(residency) = entry.current_residency {
            write_varint(out, residency);
        }
        if let Some(residency) = entry.previous_residency {
            write_varint(out, residency);
        }
        if let Some(expires_at) = entry.expires_at {
            out.extend_from_slice(&expires_at.to_be_bytes());
        }
        if let Some(operation) = entry.originating_operation {
            write_varint(out, operation);
        }
        if let Some(extended_type) = entry.extended_type {
            write_varint(out, extended_type);
        }

        // A one-byte zero length means no username; an empty one takes the
        // two-byte form.
        let username = entry.username.as_deref().unwrap_or("").as_bytes();
        if entry.username.is_none() || (1..=MAX_SHORT_USERNAME).contains(&username.len()) {
            out.push(username.len() as u8);
        } else if username.len() <= MAX_USERNAME {
            out.extend_from_slice(&(0x8000u16 | username.len() as u16).to_be_bytes());
        } else {
            return Err(AuditError::Encode(format!(
                "username of {} bytes exceeds {}",
                username.len(),
                MAX_USERNAME
            )));
        }
        out.extend_from_slice(username);

        let value_len = entry.value.as_ref().map_or(0, Vec::len);
        let mut composed = Vec::with_capacity(self.scratch.len() + value_len);
        composed.extend_from_slice(&self.scratch);
        if let Some(value) = &entry.value {
            composed.extend_from_slice(value);
        }
        Ok(composed)
    }
}

/// Encode `entry` with a fresh composer
pub fn create_audit_entry(entry: &NewAuditEntry) -> AuditResult<Vec<u8>> {
    AuditEntryComposer::new().compose(entry)
}

/// Fill a leading previous-time placeholder with `previous`, or strip it
/// when the record had no previous local time. Other entries pass through.
pub fn resolve_previous_time(mut entry: Vec<u8>, previous: Option<f64>) -> Vec<u8> {
    if !entry.starts_with(&PREVIOUS_TIME_PLACEHOLDER) {
        return entry;
    }
    match previous {
        Some(time) if time.to_be_bytes()[0] == LITERAL_TIMESTAMP_BYTE => {
            entry[..8].copy_from_slice(&time.to_be_bytes());
            entry
        }
        _ => entry.split_off(8),
    }
}

/// Entry bytes without the previous-time prefix (how entries travel between nodes)
pub fn strip_previous_time(entry: &[u8]) -> &[u8] {
    match entry.first() {
        Some(&LITERAL_TIMESTAMP_BYTE) if entry.len() >= 8 => &entry[8..],
        Some(_) if entry.starts_with(&PREVIOUS_TIME_PLACEHOLDER) => &entry[8..],
        _ => entry,
    }
}

// ========== Reading ==========

/// Parsed view over one encoded audit entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditEntryView {
    bytes: Vec<u8>,
    action: u32,
    kind: Option<ActionKind>,
    node_id: u32,
    table_id: u32,
    record_id: (usize, usize),
    version: f64,
    previous_local_time: Option<f64>,
    previous_time_pending: bool,
    previous_version: Option<f64>,
    current_residency: Option<u32>,
    previous_residency: Option<u32>,
    expires_at: Option<f64>,
    originating_operation: Option<u32>,
    extended_type: Option<u32>,
    username: Option<(usize, usize)>,
    value_offset: usize,
}

impl AuditEntryView {
    /// View returned for entries that failed to decode
    pub fn empty() -> Self {
        Self::default()
    }

    /// True for the view of an undecodable entry
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
    }

    /// Full action code
    pub fn action(&self) -> u32 {
        self.action
    }

    /// Mutation kind
    pub fn kind(&self) -> Option<ActionKind> {
        self.kind
    }

    /// True if the action code has `flag`
    pub fn has_flag(&self, flag: u32) -> bool {
        self.action & flag != 0
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    /// Record id, decoded on access
    pub fn record_id(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes[self.record_id.0..self.record_id.1])
    }

    /// Raw record id bytes (the primary store key)
    pub fn record_key(&self) -> &[u8] {
        &self.bytes[self.record_id.0..self.record_id.1]
    }

    /// Origin version
    pub fn version(&self) -> f64 {
        self.version
    }

    /// Local time of the record's previous write
    pub fn previous_local_time(&self) -> Option<f64> {
        self.previous_local_time
    }

    /// Entry still carries the fill-at-commit placeholder
    pub fn previous_time_pending(&self) -> bool {
        self.previous_time_pending
    }

    pub fn previous_version(&self) -> Option<f64> {
        self.previous_version
    }

    pub fn current_residency(&self) -> Option<u32> {
        self.current_residency
    }

    pub fn previous_residency(&self) -> Option<u32> {
        self.previous_residency
    }

    pub fn expires_at(&self) -> Option<f64> {
        self.expires_at
    }

    pub fn originating_operation(&self) -> Option<u32> {
        self.originating_operation
    }

    pub fn extended_type(&self) -> Option<u32> {
        self.extended_type
    }

    /// Username, decoded on access
    pub fn username(&self) -> Option<Cow<'_, str>> {
        self.username
            .map(|(start, end)| String::from_utf8_lossy(&self.bytes[start..end]))
    }

    /// True if a full record is embedded
    pub fn has_record(&self) -> bool {
        self.has_flag(HAS_RECORD)
    }

    /// True if a patch is embedded
    pub fn has_partial_record(&self) -> bool {
        self.has_flag(HAS_PARTIAL_RECORD)
    }

    /// Embedded value bytes
    pub fn binary_value(&self) -> &[u8] {
        &self.bytes[self.value_offset..]
    }

    /// Decode the embedded value (full record or patch). `None` when the
    /// entry carries no value.
    pub fn get_value(
        &self,
        codec: &dyn ValueCodec,
        structures: Option<&StructureDictionary>,
    ) -> AuditResult<Option<Value>> {
        if !(self.has_record() || self.has_partial_record()) || self.binary_value().is_empty() {
            return Ok(None);
        }
        codec
            .decode(self.binary_value(), structures)
            .map(Some)
            .map_err(|err| decode_error(err.to_string(), self.binary_value()))
    }

    /// Encoded entry bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Parse an audit entry
pub fn try_read_audit_entry(buffer: &[u8]) -> AuditResult<AuditEntryView> {
    let mut view = AuditEntryView {
        bytes: buffer.to_vec(),
        ..AuditEntryView::default()
    };
    let mut position = 0;

    if buffer.starts_with(&PREVIOUS_TIME_PLACEHOLDER) {
        view.previous_time_pending = true;
        position = 8;
    } else if buffer.first() == Some(&LITERAL_TIMESTAMP_BYTE) {
        view.previous_local_time = Some(read_f64(buffer, &mut position)?);
    }

    view.action = read_varint(buffer, &mut position)?;
    view.kind = Some(
        ActionKind::from_code(view.action)
            .ok_or_else(|| decode_error(format!("unknown action {:#x}", view.action), buffer))?,
    );
    view.node_id = read_varint(buffer, &mut position)?;
    view.table_id = read_varint(buffer, &mut position)?;

    let record_id_len = read_varint(buffer, &mut position)? as usize;
    slice(buffer, position, record_id_len)?;
    view.record_id = (position, position + record_id_len);
    position += record_id_len;

    view.version = read_f64(buffer, &mut position)?;
    if view.has_flag(HAS_PREVIOUS_VERSION) {
        view.previous_version = Some(read_f64(buffer, &mut position)?);
    }
    if view.has_flag(HAS_CURRENT_RESIDENCY_ID) {
        view.current_residency = Some(read_varint(buffer, &mut position)?);
    }
    if view.has_flag(HAS_PREVIOUS_RESIDENCY_ID) {
        view.previous_residency = Some(read_varint(buffer, &mut position)?);
    }
    if view.has_flag(HAS_EXPIRATION_EXTENDED_TYPE) {
        view.expires_at = Some(read_f64(buffer, &mut position)?);
    }
    if view.has_flag(HAS_ORIGINATING_OPERATION) {
        view.originating_operation = Some(read_varint(buffer, &mut position)?);
    }
    if view.has_flag(HAS_EXTENDED_TYPE) {
        view.extended_type = Some(read_varint(buffer, &mut position)?);
    }

    let first = *buffer
        .get(position)
        .ok_or_else(|| decode_error("missing username length", buffer))?;
    let (username_len, wide) = if first & 0x80 == 0 {
        position += 1;
        (first as usize, false)
    } else {
        let bytes = slice(buffer, position, 2)?;
        position += 2;
        ((u16::from_be_bytes([bytes[0], bytes[1]]) & 0x7fff) as usize, true)
    };
    slice(buffer, position, username_len)?;
    if wide || username_len > 0 {
        view.username = Some((position, position + username_len));
    }
    position += username_len;

    view.value_offset = position;
    Ok(view)
}

/// Parse an audit entry; on failure log it and return an empty view.
pub fn read_audit_entry(buffer: &[u8]) -> AuditEntryView {
    match try_read_audit_entry(buffer) {
        Ok(view) => view,
        Err(err) => {
            let reason = err.to_string();
            let len = buffer.len().to_string();
            log_event_with_fields(
                Severity::Error,
                Event::AuditDecodeFailed,
                &[("reason", &reason), ("len", &len)],
            );
            AuditEntryView::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREV: f64 = 1_726_000_000_000.25;

    fn put(record_id: &str, value: &[u8]) -> NewAuditEntry {
        NewAuditEntry {
            kind: ActionKind::Put,
            node_id: 3,
            table_id: 7,
            record_id: record_id.to_string(),
            version: 1_726_000_000_500.0,
            value: Some(value.to_vec()),
            ..Default::default()
        }
    }

    #[test]
    fn test_varint_size_classes() {
        for (value, len) in [
            (0u32, 1usize),
            (127, 1),
            (128, 2),
            (16383, 2),
            (16384, 4),
            (0x3eff_ffff, 4),
            (0x3f00_0000, 5),
            (u32::MAX, 5),
        ] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            assert_eq!(out.len(), len, "size of {value}");
            let mut position = 0;
            assert_eq!(read_varint(&out, &mut position).unwrap(), value);
            assert_eq!(position, len);
        }
    }

    #[test]
    fn test_action_66_written_wide() {
        let entry = NewAuditEntry {
            kind: ActionKind::Delete,
            previous_version: Some(1.0),
            ..Default::default()
        };
        assert_eq!(entry.action_code(), 66);
        let bytes = create_audit_entry(&entry).unwrap();
        assert_eq!(&bytes[..2], &[0x80, 66]);
        let view = try_read_audit_entry(&bytes).unwrap();
        assert_eq!(view.kind(), Some(ActionKind::Delete));
        assert_eq!(view.previous_local_time(), None);
        assert_eq!(view.previous_version(), Some(1.0));
    }

    #[test]
    fn test_previous_time_literal() {
        let mut entry = put("r1", b"{}");
        entry.previous_local_time = PreviousTime::At(PREV);
        let bytes = create_audit_entry(&entry).unwrap();
        assert_eq!(bytes[0], LITERAL_TIMESTAMP_BYTE);
        let view = try_read_audit_entry(&bytes).unwrap();
        assert_eq!(view.previous_local_time(), Some(PREV));
        assert_eq!(view.record_id(), "r1");
        assert_eq!(view.binary_value(), b"{}");
    }

    #[test]
    fn test_placeholder_resolution() {
        let mut entry = put("r1", b"1");
        entry.previous_local_time = PreviousTime::FillAtCommit;
        let bytes = create_audit_entry(&entry).unwrap();
        assert!(try_read_audit_entry(&bytes).unwrap().previous_time_pending());

        let filled = resolve_previous_time(bytes.clone(), Some(PREV));
        assert_eq!(try_read_audit_entry(&filled).unwrap().previous_local_time(), Some(PREV));

        let stripped = resolve_previous_time(bytes, None);
        let view = try_read_audit_entry(&stripped).unwrap();
        assert_eq!(view.previous_local_time(), None);
        assert!(!view.previous_time_pending());
        assert_eq!(strip_previous_time(&filled), stripped.as_slice());
    }

    #[test]
    fn test_long_username_uses_wide_length() {
        let mut entry = put("r1", b"1");
        entry.username = Some("u".repeat(200));
        let bytes = create_audit_entry(&entry).unwrap();
        let view = try_read_audit_entry(&bytes).unwrap();
        assert_eq!(view.username().unwrap().len(), 200);
        assert_eq!(view.binary_value(), b"1");
    }

    #[test]
    fn test_empty_username_differs_from_none() {
        let mut entry = put("r1", b"1");
        let without = create_audit_entry(&entry).unwrap();
        entry.username = Some(String::new());
        let empty = create_audit_entry(&entry).unwrap();
        assert_eq!(empty.len(), without.len() + 1);

        assert_eq!(try_read_audit_entry(&without).unwrap().username(), None);
        let view = try_read_audit_entry(&empty).unwrap();
        assert_eq!(view.username().as_deref(), Some(""));
        assert_eq!(view.binary_value(), b"1");
    }

    #[test]
    fn test_oversized_username_rejected() {
        let mut entry = put("r1", b"1");
        entry.username = Some("u".repeat(MAX_USERNAME + 1));
        assert!(matches!(create_audit_entry(&entry), Err(AuditError::Encode(_))));
    }

    #[test]
    fn test_corrupt_entry_reads_empty() {
        let bytes = create_audit_entry(&put("record", b"1")).unwrap();
        let view = read_audit_entry(&bytes[..4]);
        assert!(view.is_empty());
        assert!(read_audit_entry(&[0x0f]).is_empty());
    }

    #[test]
    fn test_composer_reuse_gives_independent_buffers() {
        let mut composer = AuditEntryComposer::new();
        let first = composer.compose(&put("a", b"1")).unwrap();
        let second = composer.compose(&put("bbbb", b"22")).unwrap();
        assert_eq!(try_read_audit_entry(&first).unwrap().record_id(), "a");
        assert_eq!(try_read_audit_entry(&second).unwrap().record_id(), "bbbb");
    }
}
