//! Subscription registry
//!
//! Listeners bound to a table and record key, a whole table, or a whole
//! environment. Each worker holds its own `TransactionBroadcast`; every
//! worker watches the environment's commit notices and rescans the audit log
//! itself, so every worker's subscribers see every commit whichever worker
//! made it.
//!
//! - Exactly one delivery per matching commit, in commit order
//! - A failing or panicking listener is logged and does not affect others
//! - `end()` stops delivery immediately

mod errors;
mod registry;

pub use errors::{SubscriptionError, SubscriptionResult};
pub use registry::{ChangeEvent, Listener, ListenerFn, Scope, Subscription, TransactionBroadcast};
