//! Node configuration
//!
//! One JSON file per node. Every section except `node_name` and
//! `databases` is optional and falls back to its defaults.
//!
//! ```json
//! {
//!   "node_name": "node-a",
//!   "databases": [{ "name": "app", "tables": [{ "name": "users" }] }],
//!   "audit": { "retention_ms": 259200000 },
//!   "replication": {
//!     "listen": "0.0.0.0:9325",
//!     "peers": [{ "url": "ws://10.0.0.2:9325", "name": "node-b" }]
//!   }
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::RetentionPolicy;
use crate::observability::Severity;
use crate::replication::{ReplicationError, ReplicationSettings};
use crate::table::TableDef;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Cannot parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

/// A database hosted by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    /// Tables opened at startup
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

/// Audit log retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(flatten)]
    pub retention: RetentionPolicy,

    /// Run retention cleanup on this node (default: true)
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,
}

fn default_cleanup() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            cleanup: default_cleanup(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name peers know this node by
    pub node_name: String,

    pub databases: Vec<DatabaseConfig>,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Minimum log severity: trace, info, warn, error or fatal (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl NodeConfig {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate configuration text
    pub fn from_json(text: &str) -> ConfigResult<Self> {
        let config: NodeConfig = serde_json::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Invalid("node_name is empty".to_string()));
        }
        if self.databases.is_empty() {
            return Err(ConfigError::Invalid("no databases configured".to_string()));
        }
        let mut names = HashSet::new();
        for database in &self.databases {
            if database.name.is_empty() {
                return Err(ConfigError::Invalid("database name is empty".to_string()));
            }
            if !names.insert(database.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate database {}", database.name)));
            }
            if database.tables.iter().any(|table| table.name.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "database {} has a table without a name",
                    database.name
                )));
            }
        }
        for peer in &self.replication.peers {
            if let Some(unknown) = peer.databases.iter().find(|db| !names.contains(db.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "peer {} replicates unknown database {}",
                    peer.name, unknown
                )));
            }
        }
        self.severity()?;
        self.replication.validate(&self.node_name)?;
        Ok(())
    }

    /// Parsed `log_level`
    pub fn severity(&self) -> ConfigResult<Severity> {
        self.log_level.parse().map_err(ConfigError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{"node_name": "node-a", "databases": [{"name": "app"}]}"#;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.audit, AuditConfig::default());
        assert!(config.audit.cleanup);
        assert_eq!(config.replication, ReplicationSettings::default());
        assert_eq!(config.severity().unwrap(), Severity::Info);
        assert!(config.databases[0].tables.is_empty());
    }

    #[test]
    fn test_audit_section_is_flat() {
        let config = NodeConfig::from_json(
            r#"{"node_name": "n", "databases": [{"name": "app"}],
                "audit": {"retention_ms": 60000, "cleanup": false}}"#,
        )
        .unwrap();
        assert_eq!(config.audit.retention.retention_ms, 60_000);
        assert_eq!(config.audit.retention.batch_size, RetentionPolicy::default().batch_size);
        assert!(!config.audit.cleanup);
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            r#"{"node_name": "", "databases": [{"name": "app"}]}"#,
            r#"{"node_name": "a", "databases": []}"#,
            r#"{"node_name": "a", "databases": [{"name": "app"}, {"name": "app"}]}"#,
            r#"{"node_name": "a", "databases": [{"name": "app"}], "log_level": "loud"}"#,
            r#"{"node_name": "a", "databases": [{"name": "app"}],
                "replication": {"peers": [{"url": "ws://b", "name": "b", "databases": ["other"]}]}}"#,
        ];
        for case in cases {
            assert!(
                matches!(NodeConfig::from_json(case), Err(ConfigError::Invalid(_))),
                "accepted {}",
                case
            );
        }
        assert!(matches!(
            NodeConfig::from_json(
                r#"{"node_name": "a", "databases": [{"name": "app"}],
                    "replication": {"peers": [{"url": "ws://b", "name": "b"}, {"url": "ws://c", "name": "b"}]}}"#
            ),
            Err(ConfigError::Replication(_))
        ));
        assert!(matches!(NodeConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.node_name, "node-a");

        let missing = NodeConfig::load(Path::new("/nonexistent/meshlog.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
