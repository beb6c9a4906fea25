//! Replication configuration
//!
//! Loaded as the `replication` section of the node configuration file and
//! immutable after startup.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::backoff::BackoffConfig;
use super::errors::{ReplicationError, ReplicationResult};

/// An outbound peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// WebSocket URL, e.g. `ws://10.0.0.2:9325`
    pub url: String,
    /// The peer's node name
    pub name: String,
    /// Databases to replicate with this peer (default: every local database)
    #[serde(default)]
    pub databases: Vec<String>,
}

/// TLS material paths. Passed to the transport as setup input only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

/// Replication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Address to accept peer connections on (none: outbound only)
    #[serde(default)]
    pub listen: Option<String>,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Audit entries read per backfill pass (default: 256)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Outgoing messages buffered per connection (default: 64)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Subscribe to a connecting peer over the same socket (default: true)
    #[serde(default = "default_subscribe_back")]
    pub subscribe_back: bool,

    /// Rescan interval when no commit notice arrives (default: 1000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_batch_size() -> usize {
    256
}

fn default_channel_capacity() -> usize {
    64
}

fn default_subscribe_back() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            listen: None,
            peers: Vec::new(),
            backoff: BackoffConfig::default(),
            tls: None,
            batch_size: default_batch_size(),
            channel_capacity: default_channel_capacity(),
            subscribe_back: default_subscribe_back(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ReplicationSettings {
    /// Reject settings the node cannot run with
    pub fn validate(&self, node_name: &str) -> ReplicationResult<()> {
        let mut names = HashSet::new();
        for peer in &self.peers {
            if peer.url.is_empty() || peer.name.is_empty() {
                return Err(ReplicationError::Config("peer url and name are required".to_string()));
            }
            if peer.name == node_name {
                return Err(ReplicationError::Config(format!("peer {} is this node", peer.name)));
            }
            if !names.insert(peer.name.as_str()) {
                return Err(ReplicationError::Config(format!("duplicate peer {}", peer.name)));
            }
        }
        if self.batch_size == 0 || self.channel_capacity == 0 {
            return Err(ReplicationError::Config(
                "batch_size and channel_capacity must be positive".to_string(),
            ));
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            return Err(ReplicationError::Config("backoff base_ms exceeds max_ms".to_string()));
        }
        Ok(())
    }
}
