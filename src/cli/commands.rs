//! CLI command implementations

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::observability::{log_event_with_fields, Event, Logger, Severity};
use crate::replication::{start_peers, ReplicationRuntime, ReplicationServer};
use crate::storage::spawn_read_txn_watchdog;
use crate::table::Database;

use super::args::{Cli, Command};
use super::errors::CliResult;

const READ_TXN_LEAK_THRESHOLD: Duration = Duration::from_secs(15);
const READ_TXN_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

/// Run one command
pub fn run_command(command: Command) -> CliResult<()> {
    match command {
        Command::Serve { config } => serve(&config),
        Command::Check { config } => check(&config),
    }
}

fn load(path: &Path) -> CliResult<NodeConfig> {
    let config = NodeConfig::load(path)?;
    Logger::set_min_severity(config.severity()?);
    let path_text = path.display().to_string();
    log_event_with_fields(
        Severity::Info,
        Event::ConfigLoaded,
        &[("node", &config.node_name), ("path", &path_text)],
    );
    Ok(config)
}

/// Validate a configuration file and print a JSON summary to stdout
pub fn check(path: &Path) -> CliResult<()> {
    let config = load(path)?;
    let summary = json!({
        "status": "ok",
        "node_name": config.node_name,
        "databases": config.databases.iter().map(|db| &db.name).collect::<Vec<_>>(),
        "listen": config.replication.listen,
        "peers": config.replication.peers.iter().map(|peer| &peer.name).collect::<Vec<_>>(),
        "tls": config.replication.tls.is_some(),
    });
    let mut stdout = io::stdout();
    writeln!(stdout, "{}", summary)?;
    stdout.flush()?;
    Ok(())
}

/// Run a node until interrupted
pub fn serve(path: &Path) -> CliResult<()> {
    let config = load(path)?;
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(serve_node(config))
}

/// Open the configured databases and register them with a new replication
/// runtime
pub fn open_node(config: &NodeConfig) -> CliResult<Arc<ReplicationRuntime>> {
    log_event_with_fields(Severity::Info, Event::NodeStart, &[("node", &config.node_name)]);
    let runtime = ReplicationRuntime::new(&config.node_name, config.replication.clone());
    for database in &config.databases {
        let db = Database::in_memory(&database.name, config.audit.retention.clone())?;
        for table in &database.tables {
            db.table(table.clone())?;
        }
        runtime.add_database(db)?;
    }
    Ok(runtime)
}

async fn serve_node(config: NodeConfig) -> CliResult<()> {
    let runtime = open_node(&config)?;
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    for name in runtime.database_names() {
        if let Some(context) = runtime.database(&name) {
            let env = context.db.env();
            tasks.push(spawn_read_txn_watchdog(
                env.path().to_string(),
                env.read_tracker(),
                READ_TXN_LEAK_THRESHOLD,
                READ_TXN_CHECK_INTERVAL,
                runtime.subscribe_shutdown(),
            ));
        }
    }
    if config.audit.cleanup {
        tasks.extend(runtime.start_audit_cleanup());
    }

    let server = match &config.replication.listen {
        Some(listen) => {
            let server = ReplicationServer::bind(Arc::clone(&runtime), listen).await?;
            Some(tokio::spawn(server.run()))
        }
        None => None,
    };
    tasks.extend(start_peers(&runtime));

    tokio::signal::ctrl_c().await?;
    runtime.shutdown();

    if let Some(server) = server {
        if let Ok(Err(err)) = server.await {
            let reason = err.to_string();
            log_event_with_fields(
                Severity::Error,
                Event::ReplicationDisconnected,
                &[("direction", "inbound"), ("reason", &reason)],
            );
        }
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_node_creates_tables() {
        let config = NodeConfig::from_json(
            r#"{"node_name": "node-a",
                "databases": [{"name": "app", "tables": [{"name": "users"}, {"name": "orders"}]}]}"#,
        )
        .unwrap();
        let runtime = open_node(&config).unwrap();
        let context = runtime.database("app").unwrap();
        assert_eq!(context.db.tables().len(), 2);
        assert_eq!(context.db.get_table("orders").unwrap().id(), 2);
        assert_eq!(context.identity.self_name(), "node-a");
    }
}
