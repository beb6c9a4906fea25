//! Replication Mesh Tests
//!
//! Nodes connected over in-memory WebSocket pairs:
//! - Writes flow both ways over one socket, backfill included
//! - Entries a subscriber receives directly are never forwarded to it
//! - A held lease defers a second subscription to the same peer
//! - Bad messages are dropped without closing the socket
//! - Reconnects resume from the persisted resume time

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meshlog::audit::{read_audit_entry, RetentionPolicy};
use meshlog::replication::{
    accept_connection, decode_message, encode_message, run_connection, AcceptOptions, ConnectionRole,
    ConnectionState, ProtocolMessage, ReplicationError, ReplicationResult, ReplicationRuntime,
    ReplicationSettings, SubscribeRequest,
};
use meshlog::storage::MemoryEnvironment;
use meshlog::table::{Database, Table, TableDef, WriteOptions};
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const DATABASE: &str = "app";
const WAIT: Duration = Duration::from_secs(10);

struct Node {
    name: String,
    runtime: Arc<ReplicationRuntime>,
    db: Arc<Database>,
    items: Arc<Table>,
}

impl Node {
    fn new(name: &str) -> Self {
        let settings = ReplicationSettings {
            poll_interval_ms: 50,
            ..Default::default()
        };
        let runtime = ReplicationRuntime::new(name, settings);
        let env = Arc::new(MemoryEnvironment::new(format!("{}/{}", name, DATABASE)));
        let db = Database::open(DATABASE, env, RetentionPolicy::default()).unwrap();
        let items = db.table(TableDef::new("items")).unwrap();
        runtime.add_database(Arc::clone(&db)).unwrap();
        Self {
            name: name.to_string(),
            runtime,
            db,
            items,
        }
    }

    fn put(&self, id: &str, value: Value) {
        self.db
            .transact(3, |txn| self.items.put(txn, id, value.clone(), &WriteOptions::default()))
            .unwrap();
    }

    fn has(&self, id: &str) -> bool {
        self.items.get_value(id).unwrap().is_some()
    }
}

/// Sockets of one connection: the connector's task and the acceptor's task
struct Link {
    outbound: JoinHandle<ReplicationResult<()>>,
    inbound: JoinHandle<ReplicationResult<()>>,
}

fn socket_pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(1 << 16)
}

/// `connector` dials `acceptor` for the shared database
fn connect(connector: &Node, acceptor: &Node) -> Link {
    connect_as(connector, acceptor, &acceptor.name)
}

/// Dial `acceptor`, expecting it to answer as `expected_peer`
fn connect_as(connector: &Node, acceptor: &Node, expected_peer: &str) -> Link {
    let (client, server) = socket_pair();

    let acceptor_runtime = Arc::clone(&acceptor.runtime);
    let inbound = tokio::spawn(async move {
        let ws = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        accept_connection(acceptor_runtime, ws, AcceptOptions::default()).await
    });

    let connector_runtime = Arc::clone(&connector.runtime);
    let role = ConnectionRole::Outbound {
        peer: expected_peer.to_string(),
        database: DATABASE.to_string(),
    };
    let outbound = tokio::spawn(async move {
        let ws = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        run_connection(connector_runtime, ws, role).await
    });

    Link { outbound, inbound }
}

/// Poll until `condition` holds
async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let result = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

fn shutdown(nodes: &[&Node]) {
    for node in nodes {
        node.runtime.shutdown();
    }
}

// =============================================================================
// Two-Node Replication
// =============================================================================

/// The connector backfills the acceptor, and live writes then flow both
/// ways over the same socket.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_nodes_replicate_both_ways() {
    let a = Node::new("node-a");
    let b = Node::new("node-b");
    b.put("b-early", json!({"from": "b", "seq": 1}));

    let _link = connect(&b, &a);

    eventually("backfill of b-early on a", || a.has("b-early")).await;
    assert_eq!(
        a.items.get_value("b-early").unwrap(),
        Some(json!({"from": "b", "seq": 1}))
    );

    a.put("a-live", json!({"from": "a"}));
    eventually("a-live on b", || b.has("a-live")).await;

    b.put("b-live", json!({"from": "b", "seq": 2}));
    eventually("b-live on a", || a.has("b-live")).await;

    assert_eq!(b.runtime.state("node-a", DATABASE), Some(ConnectionState::Subscribed));
    assert!(a.runtime.leases().is_held("node-b", DATABASE));
    assert!(b.runtime.leases().is_held("node-a", DATABASE));

    // Origin ids are translated into the receiver's ids.
    let identity = a.runtime.database(DATABASE).unwrap().identity;
    let b_on_a = identity.get_id_of_remote_node("node-b").unwrap();
    let (_, entry) = a.items.history("b-live").unwrap().remove(0);
    assert_eq!(entry.node_id(), b_on_a);

    eventually("resume times persisted", || {
        a.db.audit_store().resume_time("node-b").unwrap().is_some()
            && b.db.audit_store().resume_time("node-a").unwrap().is_some()
    })
    .await;

    shutdown(&[&a, &b]);
}

/// Writes to the same record converge on the highest version.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_writes_converge() {
    let a = Node::new("node-a");
    let b = Node::new("node-b");
    let _link = connect(&b, &a);
    eventually("subscriptions", || {
        a.runtime.leases().is_held("node-b", DATABASE) && b.runtime.leases().is_held("node-a", DATABASE)
    })
    .await;

    for n in 0..10 {
        a.put("shared", json!({"writer": "a", "n": n}));
        b.put("shared", json!({"writer": "b", "n": n}));
    }
    b.put("marker", json!(true));
    a.put("marker-a", json!(true));
    eventually("markers", || a.has("marker") && b.has("marker-a")).await;

    eventually("convergence", || {
        let on_a = a.items.get_entry("shared").unwrap().unwrap();
        let on_b = b.items.get_entry("shared").unwrap().unwrap();
        on_a.version == on_b.version && on_a.value == on_b.value
    })
    .await;

    shutdown(&[&a, &b]);
}

// =============================================================================
// Omission
// =============================================================================

/// B subscribes to C directly, so A must not forward C's entries to B,
/// while A's own entries still reach B.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_directly_received_origins_not_forwarded() {
    let a = Node::new("node-a");
    let b = Node::new("node-b");
    let c = Node::new("node-c");

    let _c_to_a = connect(&c, &a);
    eventually("a subscribed to c", || a.runtime.leases().is_held("node-c", DATABASE)).await;

    // Stands in for B's own connection to C.
    let direct = b
        .runtime
        .leases()
        .try_acquire("node-c", DATABASE)
        .expect("lease free");
    assert_eq!(b.runtime.omitted_for(DATABASE, "node-a"), vec!["node-c".to_string()]);

    let _b_to_a = connect(&b, &a);
    eventually("b subscribed to a", || b.runtime.leases().is_held("node-a", DATABASE)).await;

    c.put("from-c", json!({"origin": "c"}));
    eventually("from-c on a", || a.has("from-c")).await;

    a.put("from-a", json!({"origin": "a"}));
    eventually("from-a on b", || b.has("from-a")).await;

    // A streams its log in order: from-c precedes from-a there.
    assert!(!b.has("from-c"));
    assert!(b.items.history("from-c").unwrap().is_empty());

    drop(direct);
    shutdown(&[&a, &b, &c]);
}

// =============================================================================
// Connection Setup
// =============================================================================

/// A second subscription to a peer whose lease is held is deferred.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_held_lease_defers_connection() {
    let a = Node::new("node-a");
    let b = Node::new("node-b");
    let _held = b
        .runtime
        .leases()
        .try_acquire("node-a", DATABASE)
        .expect("lease free");

    let link = connect(&b, &a);
    let result = tokio::time::timeout(WAIT, link.outbound)
        .await
        .expect("connection ends")
        .unwrap();
    assert!(matches!(result, Err(ReplicationError::Closed)), "{:?}", result);

    shutdown(&[&a, &b]);
}

/// A peer answering with an unexpected name is refused.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_peer_name_refused() {
    let a = Node::new("node-a");
    let b = Node::new("node-b");

    let link = connect_as(&b, &a, "node-x");
    let result = tokio::time::timeout(WAIT, link.outbound)
        .await
        .expect("connection ends")
        .unwrap();
    assert!(matches!(result, Err(ReplicationError::Config(_))), "{:?}", result);
    assert!(!b.runtime.leases().is_held("node-x", DATABASE));

    shutdown(&[&a, &b]);
}

/// Malformed and unknown messages are logged and skipped; the socket keeps
/// serving the subscription that follows them.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_messages_do_not_close_socket() {
    let a = Node::new("node-a");
    a.put("x", json!({"value": 1}));

    let (client, server) = socket_pair();
    let runtime = Arc::clone(&a.runtime);
    let _inbound = tokio::spawn(async move {
        let ws = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        accept_connection(runtime, ws, AcceptOptions::default()).await
    });
    let mut ws = WebSocketStream::from_raw_socket(client, Role::Client, None).await;

    let greeting = ws.next().await.unwrap().unwrap().into_data();
    assert_eq!(
        decode_message(&greeting).unwrap(),
        ProtocolMessage::NodeId {
            name: "node-a".to_string(),
            database: None,
        }
    );

    let send = |message: ProtocolMessage| Message::Binary(encode_message(&message).unwrap());
    ws.send(send(ProtocolMessage::NodeId {
        name: "node-z".to_string(),
        database: Some(DATABASE.to_string()),
    }))
    .await
    .unwrap();
    // Unknown opcode, then a truncated data message.
    ws.send(Message::Binary(vec![132, b'[', b']'])).await.unwrap();
    ws.send(Message::Binary(vec![0x01, 0x02])).await.unwrap();
    ws.send(send(ProtocolMessage::IdMapping(Default::default())))
        .await
        .unwrap();
    ws.send(send(ProtocolMessage::Subscribe(SubscribeRequest {
        database: DATABASE.to_string(),
        start_time: None,
        omitted: Vec::new(),
        tables: None,
    })))
    .await
    .unwrap();

    let received = tokio::time::timeout(WAIT, async {
        while let Some(frame) = ws.next().await {
            let Ok(Message::Binary(bytes)) = frame else {
                continue;
            };
            if let Ok(ProtocolMessage::Data(batch)) = decode_message(&bytes) {
                if batch
                    .entries
                    .iter()
                    .any(|entry| read_audit_entry(entry).record_id() == "x")
                {
                    return true;
                }
            }
        }
        false
    })
    .await
    .expect("data arrives");
    assert!(received);

    shutdown(&[&a]);
}

// =============================================================================
// Reconnect
// =============================================================================

/// After a disconnect the subscriber resumes where it left off and picks
/// up what it missed.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_resumes() {
    let a = Node::new("node-a");
    let b = Node::new("node-b");
    a.put("a1", json!(1));

    let link = connect(&b, &a);
    eventually("a1 on b", || b.has("a1")).await;
    eventually("resume time on b", || {
        b.db.audit_store().resume_time("node-a").unwrap().is_some()
    })
    .await;
    let first_resume = b.db.audit_store().resume_time("node-a").unwrap().unwrap();

    link.outbound.abort();
    let _ = link.outbound.await;
    let _ = tokio::time::timeout(WAIT, link.inbound).await;
    assert!(!b.runtime.leases().is_held("node-a", DATABASE));

    a.put("a2", json!(2));
    let _link = connect(&b, &a);
    eventually("a2 on b", || b.has("a2")).await;
    eventually("resume time advanced", || {
        b.db.audit_store()
            .resume_time("node-a")
            .unwrap()
            .is_some_and(|time| time > first_resume)
    })
    .await;

    assert_eq!(b.items.history("a1").unwrap().len(), 1);
    assert_eq!(b.items.get_value("a2").unwrap(), Some(json!(2)));

    shutdown(&[&a, &b]);
}
