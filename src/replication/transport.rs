//! WebSocket transport
//!
//! `ReplicationServer` accepts peer sockets and hands each to
//! `accept_connection`. `spawn_peer` keeps one outbound connection per
//! (peer, database) alive, reconnecting with backoff until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, connect_async};

use super::backoff::Backoff;
use super::config::PeerConfig;
use super::connection::{accept_connection, run_connection, AcceptOptions, ConnectionRole};
use super::errors::{ReplicationError, ReplicationResult};
use super::runtime::{ConnectionState, ReplicationRuntime};
use crate::observability::{log_event_with_fields, Event, Severity};

/// Listener for inbound replication sockets
pub struct ReplicationServer {
    runtime: Arc<ReplicationRuntime>,
    listener: TcpListener,
}

impl ReplicationServer {
    /// Bind the listen address
    pub async fn bind(runtime: Arc<ReplicationRuntime>, addr: &str) -> ReplicationResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ReplicationError::Config(format!("failed to bind {}: {}", addr, err)))?;
        Ok(Self { runtime, listener })
    }

    pub fn local_addr(&self) -> ReplicationResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|err| ReplicationError::Transport(err.to_string()))
    }

    /// Accept sockets until the runtime shuts down
    pub async fn run(self) -> ReplicationResult<()> {
        let addr = self.local_addr()?.to_string();
        log_event_with_fields(
            Severity::Info,
            Event::NodeServing,
            &[("listen", &addr), ("node", self.runtime.node_name())],
        );
        let mut shutdown = self.runtime.subscribe_shutdown();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            let reason = err.to_string();
                            log_event_with_fields(
                                Severity::Error,
                                Event::ReplicationDisconnected,
                                &[("direction", "inbound"), ("reason", &reason)],
                            );
                            continue;
                        }
                    };
                    let runtime = Arc::clone(&self.runtime);
                    tokio::spawn(async move {
                        let remote = remote.to_string();
                        let result = match accept_async(stream).await {
                            Ok(ws) => {
                                let options = AcceptOptions {
                                    remote_addr: Some(remote.clone()),
                                };
                                accept_connection(runtime, ws, options).await
                            }
                            Err(err) => Err(err.into()),
                        };
                        if let Err(err) = result {
                            let reason = err.to_string();
                            log_event_with_fields(
                                Severity::Trace,
                                Event::ReplicationDisconnected,
                                &[("direction", "inbound"), ("reason", &reason), ("remote", &remote)],
                            );
                        }
                    });
                }
                _ = shutdown.recv() => break,
            }
        }
        Ok(())
    }
}

/// Keep an outbound connection to `peer` for `database` until shutdown
pub fn spawn_peer(runtime: Arc<ReplicationRuntime>, peer: PeerConfig, database: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(runtime.settings().backoff.clone());
        let mut shutdown = runtime.subscribe_shutdown();
        loop {
            runtime.set_state(&peer.name, &database, ConnectionState::Connecting);
            let result = match connect_async(peer.url.as_str()).await {
                Ok((ws, _)) => {
                    backoff.reset();
                    log_event_with_fields(
                        Severity::Info,
                        Event::ReplicationConnected,
                        &[("database", &database), ("direction", "outbound"), ("peer", &peer.name)],
                    );
                    let role = ConnectionRole::Outbound {
                        peer: peer.name.clone(),
                        database: database.clone(),
                    };
                    run_connection(Arc::clone(&runtime), ws, role).await
                }
                Err(err) => Err(err.into()),
            };
            runtime.set_state(&peer.name, &database, ConnectionState::Closed);

            let reason = match &result {
                Ok(()) => "closed".to_string(),
                Err(err) => err.to_string(),
            };
            let attempt = backoff.disconnects().saturating_add(1).to_string();
            log_event_with_fields(
                backoff.record_disconnect(),
                Event::ReplicationDisconnected,
                &[
                    ("attempt", &attempt),
                    ("database", &database),
                    ("peer", &peer.name),
                    ("reason", &reason),
                ],
            );
            if let Err(err) = &result {
                if err.is_fatal() {
                    log_event_with_fields(
                        Severity::Fatal,
                        Event::ReplicationDisconnected,
                        &[("database", &database), ("peer", &peer.name), ("reason", &reason)],
                    );
                    break;
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Start outbound connections for every configured peer. A peer without a
/// database list replicates every hosted database.
pub fn start_peers(runtime: &Arc<ReplicationRuntime>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for peer in &runtime.settings().peers {
        let databases = if peer.databases.is_empty() {
            runtime.database_names()
        } else {
            peer.databases.clone()
        };
        for database in databases {
            handles.push(spawn_peer(Arc::clone(runtime), peer.clone(), database));
        }
    }
    handles
}
