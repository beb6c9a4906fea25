//! Serving a peer's subscription
//!
//! Streams the audit log from the requested start time, then keeps
//! following it. The task subscribes to commit notices before its first
//! scan and rescans after every notice (or a periodic tick), so a lagged
//! notice channel never loses entries.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use super::errors::{ReplicationError, ReplicationResult};
use super::outbuf::OutgoingBuffer;
use super::protocol::{encode_message, ProtocolMessage, SubscribeRequest};
use super::runtime::DatabaseContext;
use crate::audit::{strip_previous_time, AuditEntryView};
use crate::identity::SELF_NODE_ID;
use crate::observability::{log_event_with_fields, Event, Severity};

/// Inputs of one subscription stream
pub struct ServeContext {
    pub database: DatabaseContext,
    /// Node name of the subscriber
    pub subscriber: String,
    pub request: SubscribeRequest,
    /// Encoded messages for the connection's writer
    pub out: mpsc::Sender<Vec<u8>>,
    /// Flips to true when the connection closes
    pub closed: watch::Receiver<bool>,
    pub shutdown: broadcast::Receiver<()>,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

struct StreamState {
    omitted: HashSet<u32>,
    tables: Option<HashSet<u32>>,
    /// Dictionary size last sent per table id
    sent_tables: HashMap<u32, usize>,
    sent_mapping_len: Option<usize>,
}

async fn send(out: &mpsc::Sender<Vec<u8>>, message: &ProtocolMessage) -> ReplicationResult<()> {
    let bytes = encode_message(message)?;
    out.send(bytes).await.map_err(|_| ReplicationError::Closed)
}

impl StreamState {
    fn new(ctx: &ServeContext) -> ReplicationResult<Self> {
        let identity = &ctx.database.identity;
        let mut omitted = HashSet::new();
        omitted.insert(identity.get_id_of_remote_node(&ctx.subscriber)?);
        for name in &ctx.request.omitted {
            let id = identity.get_id_of_remote_node(name)?;
            if id != SELF_NODE_ID {
                omitted.insert(id);
            }
        }

        let tables = ctx.request.tables.as_ref().map(|names| {
            names
                .iter()
                .filter_map(|name| match ctx.database.db.get_table(name) {
                    Some(table) => Some(table.id()),
                    None => {
                        log_event_with_fields(
                            Severity::Warn,
                            Event::ReplicationProtocolError,
                            &[
                                ("database", ctx.database.db.name()),
                                ("peer", &ctx.subscriber),
                                ("reason", "subscribed table not found"),
                                ("table", name),
                            ],
                        );
                        None
                    }
                })
                .collect()
        });

        Ok(Self {
            omitted,
            tables,
            sent_tables: HashMap::new(),
            sent_mapping_len: None,
        })
    }

    fn wants(&self, view: &AuditEntryView) -> bool {
        !view.is_empty()
            && !self.omitted.contains(&view.node_id())
            && self
                .tables
                .as_ref()
                .map_or(true, |tables| tables.contains(&view.table_id()))
    }

    /// Send the id mapping and table metadata the next entries depend on
    async fn send_metadata(
        &mut self,
        ctx: &ServeContext,
        entries: &[(f64, AuditEntryView)],
    ) -> ReplicationResult<()> {
        let mapping = ctx.database.identity.export_id_mapping();
        if self.sent_mapping_len != Some(mapping.len()) {
            self.sent_mapping_len = Some(mapping.len());
            send(&ctx.out, &ProtocolMessage::IdMapping(mapping)).await?;
        }

        let table_ids: HashSet<u32> = entries.iter().map(|(_, view)| view.table_id()).collect();
        let mut table_ids: Vec<u32> = table_ids.into_iter().collect();
        table_ids.sort_unstable();
        for table_id in table_ids {
            let Some(table) = ctx.database.db.table_by_id(table_id) else {
                continue;
            };
            let structures = table.structures();
            let sent = self.sent_tables.get(&table_id).copied();
            if sent.is_none() {
                send(
                    &ctx.out,
                    &ProtocolMessage::TableName {
                        table_id,
                        name: table.name().to_string(),
                    },
                )
                .await?;
            }
            if sent != Some(structures.len()) {
                self.sent_tables.insert(table_id, structures.len());
                send(
                    &ctx.out,
                    &ProtocolMessage::TableStructure {
                        table_id,
                        structures: structures.structures().to_vec(),
                    },
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// Pack entries into one data message per transaction version. Each message
/// ends with a resume marker holding its last entry's local time.
pub fn pack_entries(buffer: &mut OutgoingBuffer, entries: &[(f64, AuditEntryView)]) -> Vec<Vec<u8>> {
    let mut last: Option<(f64, f64)> = None;
    for (local_time, view) in entries {
        if let Some((time, version)) = last {
            if version != view.version() {
                buffer.finish(Some(time));
            }
        }
        if !buffer.in_progress() {
            buffer.begin(view.version());
        }
        buffer.push_entry(strip_previous_time(view.bytes()));
        last = Some((*local_time, view.version()));
    }
    buffer.finish(last.map(|(time, _)| time));
    buffer.take_finished()
}

/// Serve one subscription until the connection closes or the node shuts down
pub async fn serve_subscription(mut ctx: ServeContext) -> ReplicationResult<()> {
    let db_name = ctx.database.db.name().to_string();
    let audit = std::sync::Arc::clone(ctx.database.db.audit_store());
    let mut commits = ctx.database.db.env().subscribe_commits();
    let mut state = StreamState::new(&ctx)?;
    let mut buffer = OutgoingBuffer::default();
    let mut after = ctx.request.start_time;
    let mut backfilled = false;

    log_event_with_fields(
        Severity::Info,
        Event::ReplicationSubscribed,
        &[("database", &db_name), ("peer", &ctx.subscriber), ("role", "serving")],
    );
    state.send_metadata(&ctx, &[]).await?;

    loop {
        if *ctx.closed.borrow() {
            return Ok(());
        }
        let scanned = audit.scan_transactions_after(after, ctx.batch_size)?;
        let Some((last_time, _)) = scanned.last() else {
            if !backfilled {
                backfilled = true;
                log_event_with_fields(
                    Severity::Info,
                    Event::ReplicationBackfillComplete,
                    &[("database", &db_name), ("peer", &ctx.subscriber)],
                );
            }
            tokio::select! {
                notice = commits.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = notice {
                        return Ok(());
                    }
                }
                _ = ctx.shutdown.recv() => return Ok(()),
                changed = ctx.closed.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(ctx.poll_interval) => {}
            }
            continue;
        };
        after = Some(*last_time);

        let selected: Vec<(f64, AuditEntryView)> = scanned
            .into_iter()
            .filter(|(_, view)| state.wants(view))
            .collect();
        if !selected.is_empty() {
            state.send_metadata(&ctx, &selected).await?;
            for message in pack_entries(&mut buffer, &selected) {
                ctx.out.send(message).await.map_err(|_| ReplicationError::Closed)?;
            }
            if backfilled {
                send(&ctx.out, &ProtocolMessage::EndTxn).await?;
            }
        }
        // Let other connections on this worker run between chunks.
        tokio::task::yield_now().await;
    }
}
