//! Reconnect backoff
//!
//! Delays grow by 12% per attempt from `base_ms` up to `max_ms`. Disconnects
//! are logged at WARN on the first and every 20th after it, TRACE otherwise.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::observability::Severity;

const GROWTH: f64 = 1.12;
const WARN_EVERY: u64 = 20;

fn default_base_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

/// Backoff settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
        }
    }
}

/// Reconnect state of one outbound connection
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    disconnects: u64,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            disconnects: 0,
        }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let grown = self.config.base_ms as f64 * GROWTH.powi(self.attempt.min(1_000) as i32);
        let millis = grown.min(self.config.max_ms as f64).max(0.0);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(millis as u64)
    }

    /// Back to the base delay after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Count a disconnect and return the severity to log it at
    pub fn record_disconnect(&mut self) -> Severity {
        self.disconnects += 1;
        if self.disconnects % WARN_EVERY == 1 {
            Severity::Warn
        } else {
            Severity::Trace
        }
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            base_ms: 100,
            max_ms: 150,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(112));
        assert_eq!(backoff.next_delay(), Duration::from_millis(125));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(150));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_disconnect_log_rate() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let severities: Vec<_> = (0..41).map(|_| backoff.record_disconnect()).collect();
        let warns: Vec<_> = severities
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == Severity::Warn)
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(warns, vec![1, 21, 41]);
        assert_eq!(backoff.disconnects(), 41);
    }

    #[test]
    fn test_config_defaults() {
        let config: BackoffConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, BackoffConfig::default());
        assert_eq!(config.base_ms, 500);
    }
}
