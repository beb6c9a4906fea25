//! Replication
//!
//! Peers exchange audit log entries over one WebSocket per (peer,
//! database). A subscriber asks for everything after its persisted resume
//! time; the serving side backfills from its audit log and then follows new
//! commits. Entries from nodes the subscriber already receives directly are
//! never forwarded.
//!
//! # Invariants
//!
//! - Entries are sent in the serving node's commit order
//! - A subscriber never receives entries it originated
//! - The resume time only advances after the batch it covers is committed
//! - A bad message is logged and dropped; it never closes the socket

mod applier;
mod backoff;
mod config;
mod connection;
mod errors;
mod leases;
mod outbuf;
mod protocol;
mod runtime;
mod server;
mod transport;

pub use applier::{Applier, BatchSummary};
pub use backoff::{Backoff, BackoffConfig};
pub use config::{PeerConfig, ReplicationSettings, TlsConfig};
pub use connection::{accept_connection, run_connection, AcceptOptions, ConnectionRole, Outgoing, Session};
pub use errors::{ReplicationError, ReplicationResult};
pub use leases::{LeaseGuard, SubscriptionLeases};
pub use outbuf::OutgoingBuffer;
pub use protocol::{
    decode_message, encode_message, DataBatch, ProtocolMessage, SubscribeRequest, END_TXN, SEND_ID_MAPPING,
    SEND_NODE_ID, SEND_TABLE_NAME, SEND_TABLE_STRUCTURE, SUBSCRIBE,
};
pub use runtime::{ConnectionState, DatabaseContext, ReplicationRuntime};
pub use server::{pack_entries, serve_subscription, ServeContext};
pub use transport::{spawn_peer, start_peers, ReplicationServer};
