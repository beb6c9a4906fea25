//! Subscription leases
//!
//! At most one connection per runtime subscribes to a given (peer, database)
//! pair. Other connections to the same peer defer until the holder's guard
//! is dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

type LeaseKey = (String, String);

/// Registry of held (peer, database) leases
#[derive(Debug, Clone, Default)]
pub struct SubscriptionLeases {
    held: Arc<Mutex<HashSet<LeaseKey>>>,
}

impl SubscriptionLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `(peer, database)` unless someone holds it
    pub fn try_acquire(&self, peer: &str, database: &str) -> Option<LeaseGuard> {
        let key = (peer.to_string(), database.to_string());
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.clone()) {
            return None;
        }
        Some(LeaseGuard {
            held: Arc::clone(&self.held),
            key,
        })
    }

    pub fn is_held(&self, peer: &str, database: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.contains(&(peer.to_string(), database.to_string()))
    }

    /// Peers currently subscribed to for `database`
    pub fn peers_for(&self, database: &str) -> Vec<String> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let mut peers: Vec<String> = held
            .iter()
            .filter(|(_, db)| db == database)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }
}

/// Held lease; released on drop
#[derive(Debug)]
pub struct LeaseGuard {
    held: Arc<Mutex<HashSet<LeaseKey>>>,
    key: LeaseKey,
}

impl LeaseGuard {
    pub fn peer(&self) -> &str {
        &self.key.0
    }

    pub fn database(&self) -> &str {
        &self.key.1
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_holder() {
        let leases = SubscriptionLeases::new();
        let guard = leases.try_acquire("node-b", "app").unwrap();
        assert_eq!(guard.peer(), "node-b");
        assert!(leases.try_acquire("node-b", "app").is_none());
        assert!(leases.try_acquire("node-b", "other").is_some());
        assert!(leases.is_held("node-b", "app"));

        drop(guard);
        assert!(!leases.is_held("node-b", "app"));
        assert!(leases.try_acquire("node-b", "app").is_some());
    }

    #[test]
    fn test_peers_for_database() {
        let leases = SubscriptionLeases::new();
        let _c = leases.try_acquire("node-c", "app").unwrap();
        let _b = leases.try_acquire("node-b", "app").unwrap();
        let _x = leases.try_acquire("node-d", "other").unwrap();
        assert_eq!(leases.peers_for("app"), vec!["node-b".to_string(), "node-c".to_string()]);
    }
}
