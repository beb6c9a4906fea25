//! Transaction broadcast registry
//!
//! environment path → table id → { record key → subscriptions } plus a
//! per-table wildcard list and an environment-wide list. After every commit
//! in a watched environment the registry reads the audit entries appended
//! since its watermark and delivers each to the matching subscriptions.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::errors::{SubscriptionError, SubscriptionResult};
use crate::audit::{ActionKind, AuditEntryView, AuditStore};
use crate::observability::{log_event_with_fields, Event, Severity};
use crate::storage::CommitNotice;

/// Entries read per audit scan
const SCAN_BATCH: usize = 256;

/// One committed change as delivered to listeners
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Environment the change committed in
    pub env_path: String,
    /// Local time (audit key) of the change
    pub local_time: f64,
    /// Decoded audit entry
    pub entry: Arc<AuditEntryView>,
}

impl ChangeEvent {
    pub fn table_id(&self) -> u32 {
        self.entry.table_id()
    }

    pub fn kind(&self) -> Option<ActionKind> {
        self.entry.kind()
    }

    pub fn record_id(&self) -> String {
        self.entry.record_id().into_owned()
    }
}

/// Callback listener
pub type ListenerFn = Arc<dyn Fn(&ChangeEvent) -> SubscriptionResult<()> + Send + Sync>;

/// Where a subscription delivers
#[derive(Clone)]
pub enum Listener {
    /// Called synchronously on the notifying task
    Callback(ListenerFn),
    /// Bounded channel. Events queue per subscription and a forwarding task
    /// waits for room, so nothing is dropped; outside a runtime `notify`
    /// blocks until the receiver makes room.
    Channel(mpsc::Sender<ChangeEvent>),
}

impl Listener {
    /// Listener from a closure
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> SubscriptionResult<()> + Send + Sync + 'static,
    {
        Listener::Callback(Arc::new(f))
    }
}

struct SubscriptionEntry {
    id: Uuid,
    listener: Listener,
    active: Arc<AtomicBool>,
    /// Queue of a channel listener's forwarding task, started on first
    /// delivery inside a runtime
    forwarder: Mutex<Option<mpsc::UnboundedSender<ChangeEvent>>>,
}

impl SubscriptionEntry {
    fn new(listener: Listener) -> Self {
        Self {
            id: Uuid::new_v4(),
            listener,
            active: Arc::new(AtomicBool::new(true)),
            forwarder: Mutex::new(None),
        }
    }

    fn deliver(&self, event: &ChangeEvent) -> SubscriptionResult<()> {
        match &self.listener {
            Listener::Callback(f) => match catch_unwind(AssertUnwindSafe(|| f(event))) {
                Ok(result) => result,
                Err(_) => Err(SubscriptionError::Listener("listener panicked".to_string())),
            },
            Listener::Channel(sender) => {
                if sender.is_closed() {
                    return Err(SubscriptionError::Closed);
                }
                let mut forwarder = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner);
                if forwarder.is_none() && tokio::runtime::Handle::try_current().is_ok() {
                    *forwarder = Some(spawn_forwarder(sender.clone(), Arc::clone(&self.active)));
                }
                match forwarder.as_ref() {
                    Some(queue) => queue.send(event.clone()).map_err(|_| SubscriptionError::Closed),
                    None => sender
                        .blocking_send(event.clone())
                        .map_err(|_| SubscriptionError::Closed),
                }
            }
        }
    }
}

/// Move queued events into `sender` in order, waiting for room
fn spawn_forwarder(
    sender: mpsc::Sender<ChangeEvent>,
    active: Arc<AtomicBool>,
) -> mpsc::UnboundedSender<ChangeEvent> {
    let (queue, mut pending) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = pending.recv().await {
            // Ended subscriptions drop what is still queued.
            if !active.load(Ordering::SeqCst) {
                break;
            }
            if sender.send(event).await.is_err() {
                active.store(false, Ordering::SeqCst);
                break;
            }
        }
    });
    queue
}

#[derive(Default)]
struct TableSubscriptions {
    by_key: HashMap<String, Vec<Arc<SubscriptionEntry>>>,
    wildcard: Vec<Arc<SubscriptionEntry>>,
}

impl TableSubscriptions {
    fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.wildcard.is_empty()
    }
}

struct EnvSubscriptions {
    audit: Arc<AuditStore>,
    tables: HashMap<u32, TableSubscriptions>,
    all_tables: Vec<Arc<SubscriptionEntry>>,
    watermark: Arc<Mutex<Option<f64>>>,
}

#[derive(Default)]
struct BroadcastInner {
    envs: Mutex<HashMap<String, EnvSubscriptions>>,
}

/// What a subscription is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// One record of one table
    Key(u32, String),
    /// Every record of one table
    Table(u32),
    /// Every table of the environment
    Environment,
}

/// Handle returned by `add_subscription`; `end()` stops delivery
pub struct Subscription {
    id: Uuid,
    env_path: String,
    scope: Scope,
    active: Arc<AtomicBool>,
    registry: Weak<BroadcastInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// False once ended
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop delivery immediately and drop the registration
    pub fn end(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.env_path, &self.scope, self.id);
        }
    }
}

impl BroadcastInner {
    fn remove(&self, env_path: &str, scope: &Scope, id: Uuid) {
        let mut envs = self.envs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(env) = envs.get_mut(env_path) else {
            return;
        };
        match scope {
            Scope::Environment => env.all_tables.retain(|s| s.id != id),
            Scope::Table(table_id) | Scope::Key(table_id, _) => {
                if let Some(table) = env.tables.get_mut(table_id) {
                    match scope {
                        Scope::Key(_, key) => {
                            if let Some(list) = table.by_key.get_mut(key) {
                                list.retain(|s| s.id != id);
                                if list.is_empty() {
                                    table.by_key.remove(key);
                                }
                            }
                        }
                        _ => table.wildcard.retain(|s| s.id != id),
                    }
                    if table.is_empty() {
                        env.tables.remove(table_id);
                    }
                }
            }
        }
    }

    fn matching(&self, env_path: &str, entry: &AuditEntryView) -> Vec<Arc<SubscriptionEntry>> {
        let envs = self.envs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(env) = envs.get(env_path) else {
            return Vec::new();
        };
        let mut matched: Vec<Arc<SubscriptionEntry>> = env.all_tables.to_vec();
        if let Some(table) = env.tables.get(&entry.table_id()) {
            let record_id = entry.record_id();
            if let Some(list) = table.by_key.get(&*record_id) {
                matched.extend(list.iter().cloned());
            }
            matched.extend(table.wildcard.iter().cloned());
        }
        matched
    }

    fn notify(&self, env_path: &str) -> SubscriptionResult<usize> {
        let (audit, watermark) = {
            let envs = self.envs.lock().unwrap_or_else(PoisonError::into_inner);
            match envs.get(env_path) {
                Some(env) => (Arc::clone(&env.audit), Arc::clone(&env.watermark)),
                None => return Ok(0),
            }
        };
        // Serializes scans of one environment so each entry is delivered once.
        let mut watermark = watermark.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        loop {
            let batch = audit.scan_after(*watermark, SCAN_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for (local_time, entry) in batch {
                *watermark = Some(local_time);
                if entry.is_empty() {
                    continue;
                }
                let event = ChangeEvent {
                    env_path: env_path.to_string(),
                    local_time,
                    entry: Arc::new(entry),
                };
                for subscription in self.matching(env_path, &event.entry) {
                    if !subscription.active.load(Ordering::SeqCst) {
                        continue;
                    }
                    match subscription.deliver(&event) {
                        Ok(()) => delivered += 1,
                        Err(SubscriptionError::Closed) => {
                            subscription.active.store(false, Ordering::SeqCst);
                        }
                        Err(err) => {
                            let reason = err.to_string();
                            let id = subscription.id.to_string();
                            log_event_with_fields(
                                Severity::Warn,
                                Event::ListenerFailed,
                                &[("env", env_path), ("subscription", &id), ("reason", &reason)],
                            );
                        }
                    }
                }
            }
        }
        Ok(delivered)
    }
}

/// Per-worker subscription registry
#[derive(Clone, Default)]
pub struct TransactionBroadcast {
    inner: Arc<BroadcastInner>,
}

impl TransactionBroadcast {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes of `table_id` (one record when `key` is given).
    pub fn add_subscription(
        &self,
        audit: &Arc<AuditStore>,
        table_id: u32,
        key: Option<&str>,
        listener: Listener,
    ) -> SubscriptionResult<Subscription> {
        let scope = match key {
            Some(key) => Scope::Key(table_id, key.to_string()),
            None => Scope::Table(table_id),
        };
        self.register(audit, scope, listener)
    }

    /// Subscribe to every table of `audit`'s environment
    pub fn add_environment_subscription(
        &self,
        audit: &Arc<AuditStore>,
        listener: Listener,
    ) -> SubscriptionResult<Subscription> {
        self.register(audit, Scope::Environment, listener)
    }

    fn register(
        &self,
        audit: &Arc<AuditStore>,
        scope: Scope,
        listener: Listener,
    ) -> SubscriptionResult<Subscription> {
        let env_path = audit.env().path().to_string();
        let entry = Arc::new(SubscriptionEntry::new(listener));

        let mut envs = self.inner.envs.lock().unwrap_or_else(PoisonError::into_inner);
        if !envs.contains_key(&env_path) {
            // Subscribe to commit notices before fixing the watermark.
            let commits = audit.env().subscribe_commits();
            let watermark = audit.latest_local_time()?;
            envs.insert(
                env_path.clone(),
                EnvSubscriptions {
                    audit: Arc::clone(audit),
                    tables: HashMap::new(),
                    all_tables: Vec::new(),
                    watermark: Arc::new(Mutex::new(watermark)),
                },
            );
            if tokio::runtime::Handle::try_current().is_ok() {
                self.spawn_watcher(env_path.clone(), commits);
            }
        }
        let env = envs
            .get_mut(&env_path)
            .ok_or_else(|| SubscriptionError::Listener(format!("environment {} not registered", env_path)))?;
        match &scope {
            Scope::Environment => env.all_tables.push(Arc::clone(&entry)),
            Scope::Table(table_id) => env
                .tables
                .entry(*table_id)
                .or_default()
                .wildcard
                .push(Arc::clone(&entry)),
            Scope::Key(table_id, key) => env
                .tables
                .entry(*table_id)
                .or_default()
                .by_key
                .entry(key.clone())
                .or_default()
                .push(Arc::clone(&entry)),
        }

        Ok(Subscription {
            id: entry.id,
            env_path,
            scope,
            active: Arc::clone(&entry.active),
            registry: Arc::downgrade(&self.inner),
        })
    }

    fn spawn_watcher(&self, env_path: String, mut commits: broadcast::Receiver<CommitNotice>) {
        let registry = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match commits.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        if let Err(err) = registry.notify(&env_path) {
                            let reason = err.to_string();
                            log_event_with_fields(
                                Severity::Error,
                                Event::ListenerFailed,
                                &[("env", &env_path), ("reason", &reason)],
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Deliver every entry committed in `env_path` since the last scan.
    /// Returns the number of deliveries. Watchers call this after each
    /// commit; callers outside a runtime call it directly.
    pub fn notify(&self, env_path: &str) -> SubscriptionResult<usize> {
        self.inner.notify(env_path)
    }

    /// Number of live subscriptions in `env_path`
    pub fn subscription_count(&self, env_path: &str) -> usize {
        let envs = self.inner.envs.lock().unwrap_or_else(PoisonError::into_inner);
        envs.get(env_path).map_or(0, |env| {
            env.all_tables.len()
                + env
                    .tables
                    .values()
                    .map(|t| t.wildcard.len() + t.by_key.values().map(Vec::len).sum::<usize>())
                    .sum::<usize>()
        })
    }

    /// Number of tables with at least one subscription in `env_path`
    pub fn table_count(&self, env_path: &str) -> usize {
        let envs = self.inner.envs.lock().unwrap_or_else(PoisonError::into_inner);
        envs.get(env_path).map_or(0, |env| env.tables.len())
    }
}
