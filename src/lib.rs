//! meshlog - audit log, optimistic commit and mesh replication core
//!
//! A node hosts named databases. Every committed write appends an entry to
//! its environment's audit log; the log drives history replay,
//! subscriptions, retention and replication to peers.
//!
//! Layers, bottom up:
//! - `storage`: environment traits, in-memory engine, record header
//! - `codec`: structural value codec
//! - `audit`: audit entry codec, audit store, retention cleanup
//! - `identity`: node name to id mapping
//! - `crdt`: patch application and history replay
//! - `txn`: multi-environment optimistic commit
//! - `subscription`: change listeners
//! - `table`: databases, tables and the write path
//! - `replication`: wire protocol, connections, transport

pub mod audit;
pub mod cli;
pub mod codec;
pub mod config;
pub mod crdt;
pub mod identity;
pub mod observability;
pub mod replication;
pub mod storage;
pub mod subscription;
pub mod table;
pub mod txn;
