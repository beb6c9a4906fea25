//! Node Identity Tests
//!
//! Node name to id tables:
//! - Ids survive reopening the same environment
//! - Each environment allocates its own ids
//! - A peer's ids translate into local ids through its exported mapping

use std::sync::Arc;

use meshlog::audit::{AuditStore, RetentionPolicy, NODE_IDS};
use meshlog::identity::{IdMapping, IdentityError, NodeIdentityMap, SELF_NODE_ID};
use meshlog::replication::{ReplicationRuntime, ReplicationSettings};
use meshlog::storage::{MemoryEnvironment, StorageEnvironment};
use meshlog::table::Database;

fn env(path: &str) -> Arc<dyn StorageEnvironment> {
    Arc::new(MemoryEnvironment::new(path))
}

fn open(env: &Arc<dyn StorageEnvironment>, self_name: &str) -> NodeIdentityMap {
    let audit = AuditStore::open(Arc::clone(env), RetentionPolicy::default()).unwrap();
    NodeIdentityMap::open(audit, self_name).unwrap()
}

// =============================================================================
// Persistence Tests
// =============================================================================

/// Ids allocated before a reopen are the ids seen after it, and new names
/// continue from the highest id.
#[test]
fn test_ids_stable_across_reopen() {
    let env = env("app");
    let first = open(&env, "node-a");
    let b = first.get_id_of_remote_node("node-b").unwrap();
    let c = first.get_id_of_remote_node("node-c").unwrap();
    drop(first);

    let reopened = open(&env, "node-a");
    assert_eq!(reopened.get_id_of_remote_node("node-a").unwrap(), SELF_NODE_ID);
    assert_eq!(reopened.get_id_of_remote_node("node-b").unwrap(), b);
    assert_eq!(reopened.get_id_of_remote_node("node-c").unwrap(), c);
    assert_eq!(reopened.get_id_of_remote_node("node-d").unwrap(), c + 1);
    assert_eq!(reopened.export_id_mapping().len(), 4);
}

/// The table lives in an audit sentinel that scans never return.
#[test]
fn test_mapping_stored_as_sentinel() {
    let env = env("app");
    let audit = AuditStore::open(Arc::clone(&env), RetentionPolicy::default()).unwrap();
    let map = NodeIdentityMap::open(Arc::clone(&audit), "node-a").unwrap();
    map.get_id_of_remote_node("node-b").unwrap();

    let stored: IdMapping = serde_json::from_slice(&audit.get_sentinel(NODE_IDS).unwrap().unwrap()).unwrap();
    assert_eq!(stored, map.export_id_mapping());
    assert!(audit.scan_after(None, 100).unwrap().is_empty());
}

/// An environment written by one node refuses to open as another.
#[test]
fn test_renamed_node_rejected() {
    let env = env("app");
    open(&env, "node-a");
    let audit = AuditStore::open(Arc::clone(&env), RetentionPolicy::default()).unwrap();
    assert!(matches!(
        NodeIdentityMap::open(audit, "node-b"),
        Err(IdentityError::SelfNameMismatch { .. })
    ));
}

/// Environments do not share ids.
#[test]
fn test_ids_scoped_per_environment() {
    let orders = open(&env("orders"), "node-a");
    let users = open(&env("users"), "node-a");
    users.get_id_of_remote_node("node-x").unwrap();

    assert_eq!(orders.get_id_of_remote_node("node-y").unwrap(), 1);
    assert_eq!(users.get_id_of_remote_node("node-y").unwrap(), 2);
}

/// The runtime loads the same table when a database is hosted again.
#[test]
fn test_runtime_reuses_stored_ids() {
    let env = env("app");
    let first = ReplicationRuntime::new("node-a", ReplicationSettings::default());
    first
        .add_database(Database::open("app", Arc::clone(&env), RetentionPolicy::default()).unwrap())
        .unwrap();
    let b = first
        .database("app")
        .unwrap()
        .identity
        .get_id_of_remote_node("node-b")
        .unwrap();

    let second = ReplicationRuntime::new("node-a", ReplicationSettings::default());
    second
        .add_database(Database::open("app", env, RetentionPolicy::default()).unwrap())
        .unwrap();
    let identity = second.database("app").unwrap().identity;
    assert_eq!(identity.name_of(b).as_deref(), Some("node-b"));
}

// =============================================================================
// Translation Tests
// =============================================================================

/// Ids in a peer's mapping translate to the ids this node uses for the same
/// names, whatever numbers the peer chose.
#[test]
fn test_translate_peer_mapping() {
    let a = open(&env("a"), "node-a");
    let b = open(&env("b"), "node-b");

    // Allocate in a different order on each side.
    a.get_id_of_remote_node("node-c").unwrap();
    a.get_id_of_remote_node("node-b").unwrap();
    b.get_id_of_remote_node("node-a").unwrap();
    b.get_id_of_remote_node("node-d").unwrap();
    b.get_id_of_remote_node("node-c").unwrap();

    let remote = b.export_id_mapping();
    let translated = a.remote_to_local_node_id("node-b", &remote).unwrap();

    assert_eq!(translated.len(), remote.len());
    for (name, remote_id) in &remote {
        let expected = if *remote_id == SELF_NODE_ID {
            a.get_id_of_remote_node("node-b").unwrap()
        } else {
            a.get_id_of_remote_node(name).unwrap()
        };
        assert_eq!(translated[remote_id], expected, "{}", name);
    }
    assert_eq!(translated[&remote["node-a"]], SELF_NODE_ID);
    assert!(a.name_of(translated[&remote["node-d"]]).is_some());
}
