//! Observable events
//!
//! Events are explicit and typed; the string form is the `event` field of a
//! log line.

use std::fmt;

/// Observable events in a meshlog node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Node startup begins
    NodeStart,
    /// Node is serving replication traffic
    NodeServing,
    /// Shutdown initiated
    ShutdownStart,
    /// Configuration loaded
    ConfigLoaded,

    // Storage
    /// A read transaction stayed open past the watchdog threshold
    ReadTxnLeak,
    /// A stored value could not be decoded
    RecordDecodeFailed,

    // Audit log
    /// An audit entry could not be decoded
    AuditDecodeFailed,
    /// Audit store opened (and possibly created)
    AuditStoreOpened,
    /// One retention cleanup pass finished
    AuditCleanupPass,
    /// Retention cleanup loop started on this worker
    AuditCleanupStarted,
    /// A tombstone was physically removed after its audit entry aged out
    TombstoneRemoved,
    /// Newest audit key is ahead of the wall clock
    ClockRegression,

    // Transactions
    /// A commit lost a read condition and must be retried
    TxnConflict,
    /// An environment failed after others in the same transaction committed
    TxnPartialCommit,

    // Subscriptions
    /// A listener returned an error or panicked
    ListenerFailed,

    // Identity
    /// A node id was allocated for a new node name
    NodeIdAllocated,

    // Replication
    /// Outbound connection established
    ReplicationConnected,
    /// Connection lost; reconnect scheduled
    ReplicationDisconnected,
    /// Peer identity received
    ReplicationPeerIdentified,
    /// Subscription request sent or accepted
    ReplicationSubscribed,
    /// Backfill from the audit log finished
    ReplicationBackfillComplete,
    /// Message could not be decoded or referenced unknown state
    ReplicationProtocolError,
    /// Subscription deferred because another worker holds the lease
    ReplicationDeferred,
    /// A replicated batch was applied locally
    ReplicationApplied,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::NodeStart => "NODE_STARTUP_BEGIN",
            Event::NodeServing => "NODE_SERVING",
            Event::ShutdownStart => "SHUTDOWN_START",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::ReadTxnLeak => "READ_TXN_LEAK",
            Event::RecordDecodeFailed => "RECORD_DECODE_FAILED",

            Event::AuditDecodeFailed => "AUDIT_DECODE_FAILED",
            Event::AuditStoreOpened => "AUDIT_STORE_OPENED",
            Event::AuditCleanupPass => "AUDIT_CLEANUP_PASS",
            Event::AuditCleanupStarted => "AUDIT_CLEANUP_STARTED",
            Event::TombstoneRemoved => "TOMBSTONE_REMOVED",
            Event::ClockRegression => "CLOCK_REGRESSION",

            Event::TxnConflict => "TXN_CONFLICT",
            Event::TxnPartialCommit => "TXN_PARTIAL_COMMIT",

            Event::ListenerFailed => "LISTENER_FAILED",

            Event::NodeIdAllocated => "NODE_ID_ALLOCATED",

            Event::ReplicationConnected => "REPLICATION_CONNECTED",
            Event::ReplicationDisconnected => "REPLICATION_DISCONNECTED",
            Event::ReplicationPeerIdentified => "REPLICATION_PEER_IDENTIFIED",
            Event::ReplicationSubscribed => "REPLICATION_SUBSCRIBED",
            Event::ReplicationBackfillComplete => "REPLICATION_BACKFILL_COMPLETE",
            Event::ReplicationProtocolError => "REPLICATION_PROTOCOL_ERROR",
            Event::ReplicationDeferred => "REPLICATION_DEFERRED",
            Event::ReplicationApplied => "REPLICATION_APPLIED",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
