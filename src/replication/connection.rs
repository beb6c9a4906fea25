//! Replication connection
//!
//! One WebSocket per (peer, database). Both sides may subscribe over the
//! same socket: the connecting side always does, the accepting side does
//! when `subscribe_back` is set and it holds no other subscription to that
//! peer.
//!
//! ```text
//! acceptor                          connector
//!    | -- SEND_NODE_ID [a, null] -->  |
//!    | <-- SEND_NODE_ID [c, db] ----  |  (lease acquired)
//!    | <-- SEND_ID_MAPPING ---------  |
//!    | <-- SUBSCRIBE ---------------  |
//!    | -- mapping, tables, data ---->  |
//!    | -- SUBSCRIBE (back) --------->  |
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::applier::Applier;
use super::errors::{ReplicationError, ReplicationResult};
use super::leases::LeaseGuard;
use super::protocol::{decode_message, encode_message, DataBatch, ProtocolMessage, SubscribeRequest};
use super::runtime::{ConnectionState, DatabaseContext, ReplicationRuntime};
use super::server::{serve_subscription, ServeContext};
use crate::audit::try_read_audit_entry;
use crate::codec::StructureDictionary;
use crate::observability::{log_event_with_fields, Event, Severity};
use crate::table::{RemoteChange, Table};

/// Which end of the socket this node is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We dialed a configured peer for one database
    Outbound { peer: String, database: String },
    /// The peer dialed us
    Inbound,
}

/// Options handed over with an accepted socket
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Remote socket address, for logs
    pub remote_addr: Option<String>,
}

/// A peer table as announced by SEND_TABLE_NAME
struct PeerTable {
    name: String,
    /// Local table of the same name; `None` when this node does not have it
    local: Option<Arc<Table>>,
    structures: Option<StructureDictionary>,
}

/// What the socket loop must do after a message
#[derive(Debug)]
pub enum Outgoing {
    Send(ProtocolMessage),
    /// Start streaming our audit log to the peer
    Serve(SubscribeRequest),
}

/// Protocol state of one connection, independent of the socket
pub struct Session {
    runtime: Arc<ReplicationRuntime>,
    role: ConnectionRole,
    state: ConnectionState,
    peer: Option<String>,
    database: Option<DatabaseContext>,
    lease: Option<LeaseGuard>,
    node_map: HashMap<u32, u32>,
    peer_tables: HashMap<u32, PeerTable>,
    applier: Option<Applier>,
    serving: bool,
}

impl Session {
    pub fn new(runtime: Arc<ReplicationRuntime>, role: ConnectionRole) -> Self {
        let peer = match &role {
            ConnectionRole::Outbound { peer, .. } => Some(peer.clone()),
            ConnectionRole::Inbound => None,
        };
        Self {
            runtime,
            role,
            state: ConnectionState::Connecting,
            peer,
            database: None,
            lease: None,
            node_map: HashMap::new(),
            peer_tables: HashMap::new(),
            applier: None,
            serving: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn database_name(&self) -> Option<&str> {
        match (&self.role, &self.database) {
            (_, Some(context)) => Some(context.db.name()),
            (ConnectionRole::Outbound { database, .. }, None) => Some(database),
            (ConnectionRole::Inbound, None) => None,
        }
    }

    /// True while we hold the subscription lease for this peer
    pub fn is_subscriber(&self) -> bool {
        self.lease.is_some()
    }

    /// Socket is open. The acceptor announces itself first.
    pub fn open(&mut self) -> Vec<Outgoing> {
        self.set_state(ConnectionState::AwaitingNodeId);
        match self.role {
            ConnectionRole::Inbound => vec![Outgoing::Send(ProtocolMessage::NodeId {
                name: self.runtime.node_name().to_string(),
                database: None,
            })],
            ConnectionRole::Outbound { .. } => Vec::new(),
        }
    }

    /// Socket closed
    pub fn close(&mut self) {
        if let Some(applier) = self.applier.as_mut() {
            if let Err(err) = applier.end_transaction(None) {
                self.log_error(&err);
            }
        }
        self.set_state(ConnectionState::Closed);
        self.lease = None;
        self.applier = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        if let (Some(peer), Some(database)) = (self.peer.clone(), self.database_name()) {
            self.runtime.set_state(&peer, database, state);
        }
    }

    fn unexpected(&self, message: &ProtocolMessage) -> ReplicationError {
        ReplicationError::UnexpectedMessage {
            message: message.name(),
            state: self.state.as_str(),
        }
    }

    fn log_error(&self, err: &ReplicationError) {
        let reason = err.to_string();
        log_event_with_fields(
            Severity::Warn,
            Event::ReplicationProtocolError,
            &[
                ("database", self.database_name().unwrap_or("")),
                ("peer", self.peer().unwrap_or("")),
                ("reason", &reason),
            ],
        );
    }

    /// Handle one raw message. Errors that only spoil this message are
    /// logged here; anything returned closes the connection.
    pub fn receive(&mut self, bytes: &[u8]) -> ReplicationResult<Vec<Outgoing>> {
        let result = decode_message(bytes).and_then(|message| self.handle(message));
        match result {
            Err(err) if err.skips_message() => {
                self.log_error(&err);
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Handle one decoded message
    pub fn handle(&mut self, message: ProtocolMessage) -> ReplicationResult<Vec<Outgoing>> {
        match message {
            ProtocolMessage::NodeId { name, database } => self.on_node_id(name, database),
            ProtocolMessage::IdMapping(mapping) => {
                let (Some(peer), Some(context)) = (self.peer.as_deref(), self.database.as_ref()) else {
                    return Err(self.unexpected(&ProtocolMessage::IdMapping(mapping)));
                };
                self.node_map = context.identity.remote_to_local_node_id(peer, &mapping)?;
                Ok(Vec::new())
            }
            ProtocolMessage::Subscribe(request) => self.on_subscribe(request),
            ProtocolMessage::TableName { table_id, name } => {
                let Some(context) = self.database.as_ref() else {
                    return Err(self.unexpected(&ProtocolMessage::TableName { table_id, name }));
                };
                let local = context.db.get_table(&name);
                if local.is_none() {
                    self.log_error(&ReplicationError::Malformed(format!(
                        "peer table {} ({}) does not exist locally; its entries are skipped",
                        name, table_id
                    )));
                }
                let previous = self.peer_tables.insert(
                    table_id,
                    PeerTable {
                        name,
                        local,
                        structures: None,
                    },
                );
                if let (Some(previous), Some(table)) = (previous, self.peer_tables.get_mut(&table_id)) {
                    if previous.name == table.name {
                        table.structures = previous.structures;
                    }
                }
                Ok(Vec::new())
            }
            ProtocolMessage::TableStructure { table_id, structures } => {
                let Some(table) = self.peer_tables.get_mut(&table_id) else {
                    return Err(ReplicationError::Malformed(format!(
                        "structures for unannounced table id {}",
                        table_id
                    )));
                };
                table.structures = Some(StructureDictionary::from_structures(structures));
                Ok(Vec::new())
            }
            ProtocolMessage::Data(batch) => self.on_data(batch),
            ProtocolMessage::EndTxn => {
                if let Some(applier) = self.applier.as_mut() {
                    applier.end_transaction(None)?;
                }
                Ok(Vec::new())
            }
        }
    }

    fn on_node_id(&mut self, name: String, database: Option<String>) -> ReplicationResult<Vec<Outgoing>> {
        if self.state != ConnectionState::AwaitingNodeId {
            return Err(self.unexpected(&ProtocolMessage::NodeId { name, database }));
        }
        match self.role.clone() {
            ConnectionRole::Outbound { peer, database: db_name } => {
                if name != peer {
                    return Err(ReplicationError::Config(format!(
                        "expected peer {} but {} answered",
                        peer, name
                    )));
                }
                let context = self
                    .runtime
                    .database(&db_name)
                    .ok_or_else(|| ReplicationError::UnknownDatabase(db_name.clone()))?;
                self.database = Some(context.clone());
                self.log_identified();

                let Some(lease) = self.runtime.leases().try_acquire(&peer, &db_name) else {
                    log_event_with_fields(
                        Severity::Info,
                        Event::ReplicationDeferred,
                        &[("database", &db_name), ("peer", &peer)],
                    );
                    return Err(ReplicationError::Closed);
                };
                let mut outgoing = vec![Outgoing::Send(ProtocolMessage::NodeId {
                    name: self.runtime.node_name().to_string(),
                    database: Some(db_name.clone()),
                })];
                outgoing.extend(self.start_subscription(&context, &peer, lease)?);
                self.set_state(ConnectionState::Subscribed);
                Ok(outgoing)
            }
            ConnectionRole::Inbound => {
                let Some(db_name) = database else {
                    return Err(ReplicationError::Malformed(format!(
                        "peer {} did not name a database",
                        name
                    )));
                };
                let context = self
                    .runtime
                    .database(&db_name)
                    .ok_or_else(|| ReplicationError::UnknownDatabase(db_name.clone()))?;
                self.peer = Some(name.clone());
                self.database = Some(context.clone());
                self.log_identified();

                let mut outgoing = Vec::new();
                if self.runtime.settings().subscribe_back {
                    match self.runtime.leases().try_acquire(&name, &db_name) {
                        Some(lease) => outgoing.extend(self.start_subscription(&context, &name, lease)?),
                        None => log_event_with_fields(
                            Severity::Trace,
                            Event::ReplicationDeferred,
                            &[("database", &db_name), ("peer", &name)],
                        ),
                    }
                }
                self.set_state(ConnectionState::Subscribed);
                Ok(outgoing)
            }
        }
    }

    fn log_identified(&self) {
        log_event_with_fields(
            Severity::Info,
            Event::ReplicationPeerIdentified,
            &[
                ("database", self.database_name().unwrap_or("")),
                ("peer", self.peer().unwrap_or("")),
            ],
        );
    }

    fn start_subscription(
        &mut self,
        context: &DatabaseContext,
        peer: &str,
        lease: LeaseGuard,
    ) -> ReplicationResult<Vec<Outgoing>> {
        let database = context.db.name().to_string();
        let request = SubscribeRequest {
            database: database.clone(),
            start_time: context.db.audit_store().resume_time(peer)?,
            omitted: self.runtime.omitted_for(&database, peer),
            tables: None,
        };
        self.lease = Some(lease);
        self.applier = Some(Applier::new(Arc::clone(&context.db), peer));
        log_event_with_fields(
            Severity::Info,
            Event::ReplicationSubscribed,
            &[("database", &database), ("peer", peer), ("role", "subscriber")],
        );
        Ok(vec![
            Outgoing::Send(ProtocolMessage::IdMapping(context.identity.export_id_mapping())),
            Outgoing::Send(ProtocolMessage::Subscribe(request)),
        ])
    }

    fn on_subscribe(&mut self, request: SubscribeRequest) -> ReplicationResult<Vec<Outgoing>> {
        let Some(context) = self.database.as_ref() else {
            return Err(self.unexpected(&ProtocolMessage::Subscribe(request)));
        };
        if request.database != context.db.name() {
            return Err(ReplicationError::UnknownDatabase(request.database));
        }
        if self.serving {
            return Err(self.unexpected(&ProtocolMessage::Subscribe(request)));
        }
        self.serving = true;
        Ok(vec![Outgoing::Serve(request)])
    }

    fn on_data(&mut self, batch: DataBatch) -> ReplicationResult<Vec<Outgoing>> {
        if self.applier.is_none() {
            return Err(self.unexpected(&ProtocolMessage::Data(batch)));
        }
        for bytes in &batch.entries {
            let entry = match try_read_audit_entry(bytes) {
                Ok(entry) => entry,
                Err(err) => {
                    self.log_error(&ReplicationError::Audit(err));
                    continue;
                }
            };
            let Some(peer_table) = self.peer_tables.get(&entry.table_id()) else {
                self.log_error(&ReplicationError::Malformed(format!(
                    "entry for unannounced table id {}",
                    entry.table_id()
                )));
                continue;
            };
            let Some(table) = peer_table.local.clone() else {
                continue;
            };
            let Some(node_id) = self.node_map.get(&entry.node_id()).copied() else {
                self.log_error(&ReplicationError::Malformed(format!(
                    "entry from unmapped node id {}",
                    entry.node_id()
                )));
                continue;
            };
            let change = RemoteChange {
                entry,
                node_id,
                structures: peer_table.structures.clone(),
            };
            let Some(applier) = self.applier.as_mut() else {
                break;
            };
            if let Err(err) = applier.push(&table, &change) {
                if err.is_fatal() {
                    return Err(err);
                }
                self.log_error(&err);
            }
        }
        if let Some(applier) = self.applier.as_mut() {
            applier.end_transaction(batch.resume_time)?;
        }
        Ok(Vec::new())
    }
}

/// Drive one replication socket until it closes or the runtime shuts down
pub async fn run_connection<S>(
    runtime: Arc<ReplicationRuntime>,
    ws: S,
    role: ConnectionRole,
) -> ReplicationResult<()>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    let settings = runtime.settings().clone();
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(settings.channel_capacity);
    let (closed_tx, closed_rx) = watch::channel(false);
    let mut shutdown = runtime.subscribe_shutdown();

    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            sink.send(Message::Binary(bytes)).await?;
        }
        sink.close().await
    });

    let mut session = Session::new(Arc::clone(&runtime), role);
    let opening = session.open();
    let mut result = dispatch(&runtime, &session, opening, &out_tx, &closed_rx).await;
    while result.is_ok() {
        let incoming = tokio::select! {
            incoming = stream.next() => incoming,
            _ = shutdown.recv() => break,
        };
        let bytes = match incoming {
            None | Some(Ok(Message::Close(_))) => break,
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                result = Err(err.into());
                break;
            }
        };
        result = match session.receive(&bytes) {
            Ok(outgoing) => dispatch(&runtime, &session, outgoing, &out_tx, &closed_rx).await,
            Err(err) => Err(err),
        };
    }

    session.close();
    let _ = closed_tx.send(true);
    drop(out_tx);
    match writer.await {
        Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed)) | Ok(Err(WsError::AlreadyClosed)) => {}
        Ok(Err(err)) if result.is_ok() => result = Err(err.into()),
        Ok(Err(_)) => {}
        Err(err) => {
            if result.is_ok() {
                result = Err(ReplicationError::Transport(err.to_string()));
            }
        }
    }
    result
}

async fn dispatch(
    runtime: &Arc<ReplicationRuntime>,
    session: &Session,
    outgoing: Vec<Outgoing>,
    out: &mpsc::Sender<Vec<u8>>,
    closed: &watch::Receiver<bool>,
) -> ReplicationResult<()> {
    for item in outgoing {
        match item {
            Outgoing::Send(message) => {
                let bytes = encode_message(&message)?;
                out.send(bytes).await.map_err(|_| ReplicationError::Closed)?;
            }
            Outgoing::Serve(request) => {
                let (Some(database), Some(peer)) = (session.database.clone(), session.peer.clone()) else {
                    continue;
                };
                let settings = runtime.settings();
                let ctx = ServeContext {
                    database,
                    subscriber: peer.clone(),
                    request,
                    out: out.clone(),
                    closed: closed.clone(),
                    shutdown: runtime.subscribe_shutdown(),
                    batch_size: settings.batch_size,
                    poll_interval: Duration::from_millis(settings.poll_interval_ms),
                };
                tokio::spawn(async move {
                    if let Err(err) = serve_subscription(ctx).await {
                        if !matches!(err, ReplicationError::Closed) {
                            let reason = err.to_string();
                            log_event_with_fields(
                                Severity::Error,
                                Event::ReplicationProtocolError,
                                &[("peer", &peer), ("reason", &reason), ("role", "serving")],
                            );
                        }
                    }
                });
            }
        }
    }
    Ok(())
}

/// Serve a socket accepted by the listener
pub async fn accept_connection<S>(
    runtime: Arc<ReplicationRuntime>,
    ws: S,
    options: AcceptOptions,
) -> ReplicationResult<()>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    let remote = options.remote_addr.unwrap_or_else(|| "unknown".to_string());
    log_event_with_fields(
        Severity::Trace,
        Event::ReplicationConnected,
        &[("direction", "inbound"), ("remote", &remote)],
    );
    run_connection(runtime, ws, ConnectionRole::Inbound).await
}
