//! Node identity mapping
//!
//! Each audit store keeps a table of node names to small integer ids. Audit
//! entries carry the id of the node a write originated on. This node is
//! always id 0. Ids are allocated as `max + 1`, persisted before they are
//! returned, and never reassigned.

mod errors;

pub use errors::{IdentityError, IdentityResult};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::audit::{AuditStore, NODE_IDS};
use crate::observability::{log_event_with_fields, Event, Severity};

/// Id of the local node
pub const SELF_NODE_ID: u32 = 0;

/// Name to id table as exchanged with peers
pub type IdMapping = BTreeMap<String, u32>;

#[derive(Debug, Default)]
struct IdentityState {
    by_name: IdMapping,
    by_id: HashMap<u32, String>,
}

impl IdentityState {
    fn insert(&mut self, name: &str, id: u32) {
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
    }

    fn next_id(&self) -> IdentityResult<u32> {
        match self.by_id.keys().max() {
            None => Ok(SELF_NODE_ID + 1),
            Some(max) => max.checked_add(1).ok_or(IdentityError::Exhausted),
        }
    }
}

/// Persistent node name ↔ id table scoped to one audit store
pub struct NodeIdentityMap {
    audit: Arc<AuditStore>,
    self_name: String,
    state: Mutex<IdentityState>,
}

impl NodeIdentityMap {
    /// Load the table from `audit`, binding `self_name` to id 0
    pub fn open(audit: Arc<AuditStore>, self_name: &str) -> IdentityResult<Self> {
        let mut state = IdentityState::default();
        if let Some(bytes) = audit.get_sentinel(NODE_IDS)? {
            let stored: IdMapping = serde_json::from_slice(&bytes)
                .map_err(|err| IdentityError::Corrupt(err.to_string()))?;
            for (name, id) in stored {
                if let Some(existing) = state.by_id.get(&id) {
                    return Err(IdentityError::Corrupt(format!(
                        "id {} bound to both {} and {}",
                        id, existing, name
                    )));
                }
                state.insert(&name, id);
            }
        }

        match state.by_id.get(&SELF_NODE_ID) {
            Some(name) if name != self_name => {
                return Err(IdentityError::SelfNameMismatch {
                    stored: name.clone(),
                    configured: self_name.to_string(),
                });
            }
            Some(_) => {}
            None => {
                if state.by_name.contains_key(self_name) {
                    return Err(IdentityError::Corrupt(format!(
                        "local node {} stored with a non-zero id",
                        self_name
                    )));
                }
                state.insert(self_name, SELF_NODE_ID);
            }
        }

        let map = Self {
            audit,
            self_name: self_name.to_string(),
            state: Mutex::new(IdentityState::default()),
        };
        map.persist(&state)?;
        *map.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        Ok(map)
    }

    /// Name of the local node
    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// Full name→id table (sent to a newly connected peer)
    pub fn export_id_mapping(&self) -> IdMapping {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .clone()
    }

    /// Name bound to `id`
    pub fn name_of(&self, id: u32) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .cloned()
    }

    /// Id of `name`, allocating and persisting a new one if needed
    pub fn get_id_of_remote_node(&self, name: &str) -> IdentityResult<u32> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.id_for(&mut state, name)
    }

    /// Translate a peer's id table into `peer id → local id`. The peer's own
    /// entry (its id 0) maps to our id for `remote_name`; our name maps to 0.
    pub fn remote_to_local_node_id(
        &self,
        remote_name: &str,
        remote_mapping: &IdMapping,
    ) -> IdentityResult<HashMap<u32, u32>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut translated = HashMap::with_capacity(remote_mapping.len() + 1);
        let remote_local_id = self.id_for(&mut state, remote_name)?;
        translated.insert(SELF_NODE_ID, remote_local_id);
        for (name, remote_id) in remote_mapping {
            if *remote_id == SELF_NODE_ID {
                continue;
            }
            let local = if name == remote_name {
                remote_local_id
            } else {
                self.id_for(&mut state, name)?
            };
            translated.insert(*remote_id, local);
        }
        Ok(translated)
    }

    fn id_for(&self, state: &mut IdentityState, name: &str) -> IdentityResult<u32> {
        if let Some(id) = state.by_name.get(name) {
            return Ok(*id);
        }
        let id = state.next_id()?;
        let mut next = IdentityState {
            by_name: state.by_name.clone(),
            by_id: state.by_id.clone(),
        };
        next.insert(name, id);
        // Persist before publishing the id.
        self.persist(&next)?;
        *state = next;

        let id_text = id.to_string();
        log_event_with_fields(
            Severity::Info,
            Event::NodeIdAllocated,
            &[("env", self.audit.env().path()), ("node", name), ("id", &id_text)],
        );
        Ok(id)
    }

    fn persist(&self, state: &IdentityState) -> IdentityResult<()> {
        let bytes = serde_json::to_vec(&state.by_name)
            .map_err(|err| IdentityError::Corrupt(err.to_string()))?;
        self.audit.put_sentinel(NODE_IDS, bytes)?;
        Ok(())
    }
}
