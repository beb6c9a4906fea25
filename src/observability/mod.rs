//! Observability
//!
//! Structured JSON logging and typed lifecycle events. Logging never fails
//! the caller: write errors are swallowed.
//!
//! ```ignore
//! use meshlog::observability::{log_event_with_fields, Event, Severity};
//!
//! log_event_with_fields(Severity::Warn, Event::ReplicationDisconnected, &[("peer", "node-b")]);
//! ```

mod events;
mod logger;

pub use events::Event;
pub use logger::{Logger, Severity};

/// Log a lifecycle event
pub fn log_event(severity: Severity, event: Event) {
    Logger::log(severity, event.as_str(), &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(severity: Severity, event: Event, fields: &[(&str, &str)]) {
    Logger::log(severity, event.as_str(), fields);
}

/// Hex dump of the leading bytes of a buffer, used in decode error context
pub fn hex_prefix(bytes: &[u8], max: usize) -> String {
    bytes
        .iter()
        .take(max)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
