//! Applies replicated changes to local tables
//!
//! Changes of one data message are queued into a single untracked
//! transaction and committed together when the message ends. The peer's
//! resume time is persisted only after that commit succeeds.

use std::sync::Arc;

use super::errors::ReplicationResult;
use crate::observability::{log_event_with_fields, Event, Severity};
use crate::table::{ApplyOutcome, Database, RemoteChange, Table, TableError};
use crate::txn::{Isolation, Transaction};

/// Counts of what a batch did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub applied: usize,
    pub superseded: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Superseded => self.superseded += 1,
            ApplyOutcome::Duplicate => self.duplicates += 1,
            ApplyOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.applied + self.superseded + self.duplicates + self.skipped
    }
}

/// Receiving side of one (peer, database) subscription
pub struct Applier {
    db: Arc<Database>,
    peer: String,
    pending: Option<Transaction>,
    summary: BatchSummary,
}

impl Applier {
    pub fn new(db: Arc<Database>, peer: &str) -> Self {
        Self {
            db,
            peer: peer.to_string(),
            pending: None,
            summary: BatchSummary::default(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue one change into the open batch
    pub fn push(&mut self, table: &Table, change: &RemoteChange) -> ReplicationResult<ApplyOutcome> {
        let db = &self.db;
        let txn = self
            .pending
            .get_or_insert_with(|| db.begin(Isolation::Untracked));
        let outcome = table.apply_replicated(txn, change)?;
        self.summary.record(outcome);
        Ok(outcome)
    }

    /// Commit the open batch and, when given, persist the peer's resume time
    pub fn end_transaction(&mut self, resume_time: Option<f64>) -> ReplicationResult<BatchSummary> {
        let summary = std::mem::take(&mut self.summary);
        if let Some(txn) = self.pending.take() {
            // Untracked batches carry no read conditions.
            txn.commit().map_err(TableError::from)?;
        }
        if let Some(time) = resume_time {
            self.db.audit_store().set_resume_time(&self.peer, time)?;
        }
        if summary.total() > 0 {
            let applied = summary.applied.to_string();
            let total = summary.total().to_string();
            log_event_with_fields(
                Severity::Trace,
                Event::ReplicationApplied,
                &[
                    ("database", self.db.name()),
                    ("peer", &self.peer),
                    ("applied", &applied),
                    ("entries", &total),
                ],
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{create_audit_entry, read_audit_entry, ActionKind, NewAuditEntry, RetentionPolicy};
    use crate::codec::{JsonCodec, ValueCodec};
    use crate::table::TableDef;
    use serde_json::json;

    fn change(record_id: &str, version: f64) -> RemoteChange {
        let bytes = create_audit_entry(&NewAuditEntry {
            kind: ActionKind::Put,
            node_id: 0,
            table_id: 1,
            record_id: record_id.to_string(),
            version,
            value: Some(JsonCodec::new().encode(&json!({"id": record_id}))),
            ..Default::default()
        })
        .unwrap();
        RemoteChange {
            entry: read_audit_entry(&bytes),
            node_id: 1,
            structures: None,
        }
    }

    #[test]
    fn test_batch_commits_together() {
        let db = Database::in_memory("app", RetentionPolicy::default()).unwrap();
        let table = db.table(TableDef::new("items")).unwrap();
        let mut applier = Applier::new(Arc::clone(&db), "node-b");

        applier.push(&table, &change("a", 5_000.0)).unwrap();
        applier.push(&table, &change("b", 5_000.0)).unwrap();
        assert_eq!(table.get_value("a").unwrap(), None);

        let summary = applier.end_transaction(Some(9_000.0)).unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(table.get_value("b").unwrap(), Some(json!({"id": "b"})));
        assert_eq!(db.audit_store().resume_time("node-b").unwrap(), Some(9_000.0));

        applier.push(&table, &change("a", 5_000.0)).unwrap();
        let summary = applier.end_transaction(None).unwrap();
        assert_eq!(summary.duplicates, 1);
        assert_eq!(db.audit_store().resume_time("node-b").unwrap(), Some(9_000.0));
    }
}
