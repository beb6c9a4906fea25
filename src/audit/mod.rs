//! Audit log
//!
//! Every committed mutation appends one audit entry to its environment's
//! audit store, keyed by the write's local time. The log drives replication
//! (backfill and live streaming), history replay and subscriptions.
//!
//! # Invariants
//!
//! - Keys strictly increase per environment and are never reused
//! - Every put after a record's first write carries the previous local time
//! - A corrupt entry never halts a scan: it reads as an empty view

mod cleanup;
mod entry;
mod errors;
mod store;

pub use cleanup::{next_cleanup_delay, CleanupPass, RetentionPolicy, MIN_CLEANUP_DELAY};
pub use entry::{
    create_audit_entry, read_audit_entry, read_varint, resolve_previous_time, strip_previous_time,
    try_read_audit_entry, varint_len, write_varint, ActionKind, AuditEntryComposer, AuditEntryView,
    NewAuditEntry, PreviousTime, HAS_BLOBS, HAS_CURRENT_RESIDENCY_ID, HAS_EXPIRATION_EXTENDED_TYPE,
    HAS_EXTENDED_TYPE, HAS_ORIGINATING_OPERATION, HAS_PARTIAL_RECORD, HAS_PREVIOUS_RESIDENCY_ID,
    HAS_PREVIOUS_VERSION, HAS_RECORD, KIND_MASK, PREVIOUS_TIME_PLACEHOLDER,
};
pub use errors::{AuditError, AuditResult};
pub use store::{
    audit_key, blob_ids, parse_audit_key, sentinel_key, AuditKey, AuditStore, TombstoneCallback,
    TombstoneRemoval, AUDIT_STORE, BLOB_REF_KEY, LAST_REMOVED, NODE_IDS, SENTINEL_PREFIX,
};
