//! Transaction coordinator
//!
//! A `Transaction` collects, per storage environment, the read conditions it
//! observed and the writes it wants to make. `commit` applies everything or
//! nothing:
//!
//! - environments with read conditions are locked in path order and
//!   validated first (phase 1); any lost condition releases every lock and
//!   commit returns `false` with nothing written anywhere
//! - once every conditional environment holds, each applies its writes
//!   (phase 2)
//! - environments with writes but no reads commit after that
//!
//! A single conditional environment is the degenerate case of the same
//! protocol. Callers retry the whole logical operation on `false`.

mod errors;

pub use errors::{TxnError, TxnResult};

use std::sync::Arc;

use crate::observability::{log_event_with_fields, Event, Severity};
use crate::storage::{
    CommitReceipt, PreparedCommit, ReadCondition, StorageEnvironment, WriteOp, WriteValue,
};

/// Whether reads become commit conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Every read is revalidated at commit (safe to retry)
    #[default]
    Tracked,
    /// Reads are not revalidated
    Untracked,
}

/// Work for one environment
pub struct EnvTransaction {
    env: Arc<dyn StorageEnvironment>,
    conditions: Vec<ReadCondition>,
    writes: Vec<WriteOp>,
}

impl EnvTransaction {
    fn new(env: Arc<dyn StorageEnvironment>) -> Self {
        Self {
            env,
            conditions: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Environment
    pub fn env(&self) -> &Arc<dyn StorageEnvironment> {
        &self.env
    }

    /// Recorded read conditions
    pub fn conditions(&self) -> &[ReadCondition] {
        &self.conditions
    }

    /// Queued writes
    pub fn writes(&self) -> &[WriteOp] {
        &self.writes
    }
}

/// Receipts of a committed transaction, one per environment that wrote
pub type CommitReceipts = Vec<(String, CommitReceipt)>;

/// One logical operation spanning any number of environments
pub struct Transaction {
    version: f64,
    isolation: Isolation,
    envs: Vec<EnvTransaction>,
}

impl Transaction {
    /// Transaction with an explicit version
    pub fn new(version: f64, isolation: Isolation) -> Self {
        Self {
            version,
            isolation,
            envs: Vec::new(),
        }
    }

    /// Transaction versioned by `env`'s clock
    pub fn begin(env: &Arc<dyn StorageEnvironment>, isolation: Isolation) -> Self {
        Self::new(env.now(), isolation)
    }

    /// Version stamped on every write
    pub fn version(&self) -> f64 {
        self.version
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Per-environment work, in the order environments were first touched
    pub fn environments(&self) -> &[EnvTransaction] {
        &self.envs
    }

    /// True if nothing was read or queued
    pub fn is_empty(&self) -> bool {
        self.envs
            .iter()
            .all(|env| env.conditions.is_empty() && env.writes.is_empty())
    }

    fn env_mut(&mut self, env: &Arc<dyn StorageEnvironment>) -> &mut EnvTransaction {
        let index = match self.envs.iter().position(|e| e.env.path() == env.path()) {
            Some(index) => index,
            None => {
                self.envs.push(EnvTransaction::new(Arc::clone(env)));
                self.envs.len() - 1
            }
        };
        &mut self.envs[index]
    }

    /// Record that `key` in `store` was read at `version` (`None` = absent).
    /// Untracked transactions ignore reads.
    pub fn record_read(
        &mut self,
        env: &Arc<dyn StorageEnvironment>,
        store: &str,
        key: &[u8],
        version: Option<f64>,
    ) {
        if self.isolation == Isolation::Untracked {
            return;
        }
        let participant = self.env_mut(env);
        let seen = participant
            .conditions
            .iter()
            .any(|c| c.store == store && c.key == key);
        if !seen {
            participant.conditions.push(ReadCondition {
                store: store.to_string(),
                key: key.to_vec(),
                version,
            });
        }
    }

    /// Queue a write
    pub fn queue_write(&mut self, env: &Arc<dyn StorageEnvironment>, op: WriteOp) {
        self.env_mut(env).writes.push(op);
    }

    /// Latest queued write that changes `key` in `store`. Audit-only writes
    /// are skipped.
    pub fn pending_write(
        &self,
        env: &Arc<dyn StorageEnvironment>,
        store: &str,
        key: &[u8],
    ) -> Option<&WriteOp> {
        self.envs
            .iter()
            .find(|participant| participant.env.path() == env.path())?
            .writes
            .iter()
            .rev()
            .find(|op| op.store == store && op.key == key && op.value != WriteValue::AuditOnly)
    }

    /// Commit. `Ok(false)` means a read condition no longer holds and nothing
    /// was written.
    pub fn commit(self) -> TxnResult<bool> {
        Ok(self.commit_with_receipts()?.is_some())
    }

    /// Commit, returning the local times assigned per environment
    pub fn commit_with_receipts(self) -> TxnResult<Option<CommitReceipts>> {
        let mut participants: Vec<EnvTransaction> = self
            .envs
            .into_iter()
            .filter(|p| !p.conditions.is_empty() || !p.writes.is_empty())
            .collect();
        // Global lock order.
        participants.sort_by(|a, b| a.env.path().cmp(b.env.path()));
        let (mut conditional, mut write_only): (Vec<_>, Vec<_>) = participants
            .into_iter()
            .partition(|p| !p.conditions.is_empty());

        let conditional_writes: Vec<Vec<WriteOp>> = conditional
            .iter_mut()
            .map(|p| std::mem::take(&mut p.writes))
            .collect();
        let write_only_writes: Vec<Vec<WriteOp>> = write_only
            .iter_mut()
            .map(|p| std::mem::take(&mut p.writes))
            .collect();

        // Phase 1: lock and validate every conditional environment.
        let mut prepared: Vec<Box<dyn PreparedCommit + '_>> = Vec::with_capacity(conditional.len());
        for participant in &conditional {
            match participant.env.prepare(&participant.conditions)? {
                Some(guard) => prepared.push(guard),
                None => {
                    log_event_with_fields(
                        Severity::Trace,
                        Event::TxnConflict,
                        &[("env", participant.env.path())],
                    );
                    return Ok(None);
                }
            }
        }

        // Phase 2: apply.
        let mut receipts = CommitReceipts::new();
        let ready = prepared
            .into_iter()
            .zip(conditional.iter())
            .zip(conditional_writes);
        for ((guard, participant), writes) in ready {
            let receipt = guard
                .commit(writes)
                .map_err(|source| partial(participant, receipts.len(), source))?;
            receipts.push((participant.env.path().to_string(), receipt));
        }

        for (participant, writes) in write_only.iter().zip(write_only_writes) {
            if writes.is_empty() {
                continue;
            }
            let guard = match participant.env.prepare(&[]) {
                Ok(Some(guard)) => guard,
                Ok(None) => continue,
                Err(source) => return Err(partial(participant, receipts.len(), source)),
            };
            let receipt = guard
                .commit(writes)
                .map_err(|source| partial(participant, receipts.len(), source))?;
            receipts.push((participant.env.path().to_string(), receipt));
        }
        Ok(Some(receipts))
    }
}

fn partial(participant: &EnvTransaction, committed: usize, source: crate::storage::StorageError) -> TxnError {
    if committed == 0 {
        return TxnError::Storage(source);
    }
    let committed_text = committed.to_string();
    log_event_with_fields(
        Severity::Error,
        Event::TxnPartialCommit,
        &[("env", participant.env.path()), ("committed", &committed_text)],
    );
    TxnError::PartialCommit {
        env: participant.env.path().to_string(),
        committed,
        source,
    }
}
