//! Replication runtime context
//!
//! Everything one node's replication needs, owned explicitly so several
//! nodes can run in one process: hosted databases with their identity maps,
//! subscription leases, the local subscription registry, connection status
//! per (peer, database), settings and the shutdown signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::config::ReplicationSettings;
use super::errors::{ReplicationError, ReplicationResult};
use super::leases::SubscriptionLeases;
use crate::identity::NodeIdentityMap;
use crate::observability::{log_event_with_fields, Event, Severity};
use crate::subscription::TransactionBroadcast;
use crate::table::Database;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket being opened
    Connecting,
    /// Open; the peer has not identified itself yet
    AwaitingNodeId,
    /// Peer known; streams running
    Subscribed,
    /// Closed; an outbound connection retries after its backoff delay
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingNodeId => "awaiting node id",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Closed => "closed",
        }
    }
}

/// A hosted database and its node identity map
#[derive(Clone)]
pub struct DatabaseContext {
    pub db: Arc<Database>,
    pub identity: Arc<NodeIdentityMap>,
}

/// Per-node replication context
pub struct ReplicationRuntime {
    node_name: String,
    settings: ReplicationSettings,
    databases: RwLock<HashMap<String, DatabaseContext>>,
    leases: SubscriptionLeases,
    broadcast: TransactionBroadcast,
    status: Mutex<HashMap<(String, String), ConnectionState>>,
    shutdown: broadcast::Sender<()>,
}

impl ReplicationRuntime {
    pub fn new(node_name: &str, settings: ReplicationSettings) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            node_name: node_name.to_string(),
            settings,
            databases: RwLock::new(HashMap::new()),
            leases: SubscriptionLeases::new(),
            broadcast: TransactionBroadcast::new(),
            status: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    /// Host `db` for replication, loading its node identity map
    pub fn add_database(&self, db: Arc<Database>) -> ReplicationResult<()> {
        let identity = NodeIdentityMap::open(Arc::clone(db.audit_store()), &self.node_name)?;
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        if databases.contains_key(db.name()) {
            return Err(ReplicationError::Config(format!("database {} added twice", db.name())));
        }
        databases.insert(
            db.name().to_string(),
            DatabaseContext {
                db,
                identity: Arc::new(identity),
            },
        );
        Ok(())
    }

    pub fn database(&self, name: &str) -> Option<DatabaseContext> {
        let databases = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        databases.get(name).cloned()
    }

    /// Names of hosted databases, sorted
    pub fn database_names(&self) -> Vec<String> {
        let databases = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = databases.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn leases(&self) -> &SubscriptionLeases {
        &self.leases
    }

    /// Local subscription registry
    pub fn broadcast(&self) -> &TransactionBroadcast {
        &self.broadcast
    }

    /// Peers this node already subscribes to for `database`, except `peer`.
    /// Sent as the omitted set of a new subscription.
    pub fn omitted_for(&self, database: &str, peer: &str) -> Vec<String> {
        self.leases
            .peers_for(database)
            .into_iter()
            .filter(|name| name != peer)
            .collect()
    }

    pub fn set_state(&self, peer: &str, database: &str, state: ConnectionState) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.insert((peer.to_string(), database.to_string()), state);
    }

    pub fn state(&self, peer: &str, database: &str) -> Option<ConnectionState> {
        let status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.get(&(peer.to_string(), database.to_string())).copied()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Stop every connection, listener and cleanup loop of this runtime
    pub fn shutdown(&self) {
        log_event_with_fields(Severity::Info, Event::ShutdownStart, &[("node", &self.node_name)]);
        let _ = self.shutdown.send(());
    }

    /// Start retention cleanup for every hosted database. Must run on one
    /// designated worker only.
    pub fn start_audit_cleanup(&self) -> Vec<JoinHandle<()>> {
        let databases = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        databases
            .values()
            .filter_map(|context| {
                context
                    .db
                    .audit_store()
                    .schedule_audit_cleanup(None, self.shutdown.subscribe())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RetentionPolicy;

    #[test]
    fn test_databases() {
        let runtime = ReplicationRuntime::new("node-a", ReplicationSettings::default());
        runtime
            .add_database(Database::in_memory("b-db", RetentionPolicy::default()).unwrap())
            .unwrap();
        runtime
            .add_database(Database::in_memory("a-db", RetentionPolicy::default()).unwrap())
            .unwrap();
        assert_eq!(runtime.database_names(), vec!["a-db".to_string(), "b-db".to_string()]);
        let context = runtime.database("a-db").unwrap();
        assert_eq!(context.identity.self_name(), "node-a");
        assert!(runtime.database("missing").is_none());

        let duplicate = Database::in_memory("a-db", RetentionPolicy::default()).unwrap();
        assert!(runtime.add_database(duplicate).is_err());
    }

    #[test]
    fn test_omitted_follows_leases() {
        let runtime = ReplicationRuntime::new("node-a", ReplicationSettings::default());
        let _b = runtime.leases().try_acquire("node-b", "app").unwrap();
        let _c = runtime.leases().try_acquire("node-c", "app").unwrap();
        assert_eq!(runtime.omitted_for("app", "node-b"), vec!["node-c".to_string()]);
        assert!(runtime.omitted_for("other", "node-b").is_empty());
    }

    #[test]
    fn test_connection_state() {
        let runtime = ReplicationRuntime::new("node-a", ReplicationSettings::default());
        assert_eq!(runtime.state("node-b", "app"), None);
        runtime.set_state("node-b", "app", ConnectionState::Subscribed);
        assert_eq!(runtime.state("node-b", "app"), Some(ConnectionState::Subscribed));
        assert_eq!(ConnectionState::AwaitingNodeId.as_str(), "awaiting node id");
    }
}
