//! Audit retention cleanup
//!
//! A single self-rescheduling task per audit store removes entries older
//! than the retention horizon in capped batches:
//!
//! - horizon = now - retention / (1 + pressure²)
//! - after a pass that removed something the delay halves (floor 10ms)
//! - after an empty pass the delay doubles (cap retention / 10)
//! - the `last-removed` watermark is persisted after every batch

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::errors::AuditResult;
use super::store::AuditStore;
use crate::observability::{log_event_with_fields, Event, Severity};
use crate::storage::wall_clock_ms;

/// Shortest delay between passes
pub const MIN_CLEANUP_DELAY: Duration = Duration::from_millis(10);

const DEFAULT_RETENTION_MS: u64 = 3 * 24 * 60 * 60 * 1000;
const DEFAULT_BATCH_SIZE: usize = 1000;

fn default_retention_ms() -> u64 {
    DEFAULT_RETENTION_MS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// How long audit entries are kept and how many are removed per pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Retention in milliseconds
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Maximum entries removed per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_ms: DEFAULT_RETENTION_MS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl RetentionPolicy {
    /// Longest delay between passes
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.retention_ms / 10).max(MIN_CLEANUP_DELAY)
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupPass {
    /// Entries removed
    pub removed: usize,
    /// Retention horizon used
    pub horizon: f64,
}

/// Delay before the next pass
pub fn next_cleanup_delay(current: Duration, removed_any: bool, max: Duration) -> Duration {
    if removed_any {
        (current / 2).max(MIN_CLEANUP_DELAY)
    } else {
        (current * 2).min(max)
    }
}

impl AuditStore {
    /// Remove up to one batch of entries older than the retention horizon
    pub fn run_cleanup_pass(&self, now: f64) -> AuditResult<CleanupPass> {
        let horizon = self.retention_horizon(now);
        let batch = self.scan_after(None, self.policy().batch_size)?;
        let mut removed = 0;
        let mut watermark = None;
        for (local_time, view) in batch {
            if local_time >= horizon {
                break;
            }
            if self.remove_audit_entry(local_time, &view)? {
                removed += 1;
            }
            watermark = Some(local_time);
        }
        if let Some(local_time) = watermark {
            self.set_last_removed(local_time)?;
        }
        if removed > 0 {
            let removed_text = removed.to_string();
            let horizon_text = format!("{:.3}", horizon);
            log_event_with_fields(
                Severity::Trace,
                Event::AuditCleanupPass,
                &[
                    ("env", self.env().path()),
                    ("removed", &removed_text),
                    ("horizon", &horizon_text),
                ],
            );
        }
        Ok(CleanupPass { removed, horizon })
    }

    /// Start the cleanup loop. Returns `None` if a loop is already running
    /// for this store.
    pub fn schedule_audit_cleanup(
        self: &Arc<Self>,
        initial_delay: Option<Duration>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let store = Arc::clone(self);
        let max_delay = store.policy().max_delay();
        let mut delay = initial_delay.unwrap_or(max_delay).min(max_delay);

        Some(tokio::spawn(async move {
            log_event_with_fields(
                Severity::Info,
                Event::AuditCleanupStarted,
                &[("env", store.env().path())],
            );
            if let Err(err) = store.check_clock() {
                let reason = err.to_string();
                log_event_with_fields(
                    Severity::Error,
                    Event::AuditCleanupPass,
                    &[("env", store.env().path()), ("error", &reason)],
                );
            }
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => break,
                }
                let removed_any = match store.run_cleanup_pass(wall_clock_ms()) {
                    Ok(pass) => pass.removed > 0,
                    Err(err) => {
                        let reason = err.to_string();
                        log_event_with_fields(
                            Severity::Error,
                            Event::AuditCleanupPass,
                            &[("env", store.env().path()), ("error", &reason)],
                        );
                        if err.is_fatal() {
                            break;
                        }
                        false
                    }
                };
                delay = next_cleanup_delay(delay, removed_any, max_delay);
            }
            store.cleanup_running.store(false, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_halves_and_doubles() {
        let max = Duration::from_secs(60);
        let delay = Duration::from_secs(8);
        assert_eq!(next_cleanup_delay(delay, true, max), Duration::from_secs(4));
        assert_eq!(next_cleanup_delay(delay, false, max), Duration::from_secs(16));
        assert_eq!(next_cleanup_delay(Duration::from_millis(12), true, max), MIN_CLEANUP_DELAY);
        assert_eq!(next_cleanup_delay(Duration::from_secs(40), false, max), max);
    }

    #[test]
    fn test_max_delay_is_tenth_of_retention() {
        let policy = RetentionPolicy {
            retention_ms: 60_000,
            batch_size: 10,
        };
        assert_eq!(policy.max_delay(), Duration::from_secs(6));
    }
}
