//! Database: one environment, its audit store and its tables

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::errors::{TableError, TableResult};
use super::table::{Table, TableDef};
use crate::audit::{AuditStore, RetentionPolicy};
use crate::storage::{KvStore, MemoryEnvironment, StorageEnvironment, BLOB_STORE};
use crate::txn::{Isolation, Transaction};

/// Audit sentinel holding the table name → id table
pub const TABLE_IDS: &str = "table-ids";

#[derive(Default)]
struct TableRegistry {
    by_name: HashMap<String, Arc<Table>>,
    by_id: HashMap<u32, Arc<Table>>,
}

/// A named database backed by one storage environment
pub struct Database {
    name: String,
    env: Arc<dyn StorageEnvironment>,
    audit: Arc<AuditStore>,
    blobs: Arc<dyn KvStore>,
    tables: RwLock<TableRegistry>,
    allocation: Mutex<()>,
}

impl Database {
    /// Open a database over `env`
    pub fn open(
        name: &str,
        env: Arc<dyn StorageEnvironment>,
        policy: RetentionPolicy,
    ) -> TableResult<Arc<Self>> {
        let audit = AuditStore::open(Arc::clone(&env), policy)?;
        let (blobs, _) = env.open_store(BLOB_STORE)?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            env,
            audit,
            blobs,
            tables: RwLock::new(TableRegistry::default()),
            allocation: Mutex::new(()),
        }))
    }

    /// Open a database over a fresh in-memory environment named after it
    pub fn in_memory(name: &str, policy: RetentionPolicy) -> TableResult<Arc<Self>> {
        Self::open(name, Arc::new(MemoryEnvironment::new(name)), policy)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage environment
    pub fn env(&self) -> &Arc<dyn StorageEnvironment> {
        &self.env
    }

    /// Audit store
    pub fn audit_store(&self) -> &Arc<AuditStore> {
        &self.audit
    }

    /// Open (or create) a table. The table id is allocated once and
    /// persisted in the audit store.
    pub fn table(&self, def: TableDef) -> TableResult<Arc<Table>> {
        if def.name.is_empty() {
            return Err(TableError::InvalidTable {
                name: def.name,
                reason: "name is empty".to_string(),
            });
        }
        if let Some(table) = self.get_table(&def.name) {
            return Ok(table);
        }

        let _allocation = self.allocation.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = self.get_table(&def.name) {
            return Ok(table);
        }
        let id = self.table_id(&def.name)?;
        let table = Arc::new(Table::open(
            def,
            id,
            Arc::clone(&self.env),
            Arc::clone(&self.audit),
        )?);
        self.audit.register_table(id, table.primary_store().clone());

        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.by_name.insert(table.name().to_string(), Arc::clone(&table));
        tables.by_id.insert(id, Arc::clone(&table));
        Ok(table)
    }

    /// Open table by name
    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.by_name.get(name).cloned()
    }

    /// Open table by id
    pub fn table_by_id(&self, id: u32) -> Option<Arc<Table>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.by_id.get(&id).cloned()
    }

    /// Every open table, ordered by id
    pub fn tables(&self) -> Vec<Arc<Table>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = tables.by_id.values().cloned().collect();
        all.sort_by_key(|table| table.id());
        all
    }

    fn table_id(&self, name: &str) -> TableResult<u32> {
        let mut ids: BTreeMap<String, u32> = match self.audit.get_sentinel(TABLE_IDS)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|err| TableError::InvalidTable {
                name: name.to_string(),
                reason: format!("stored table ids are corrupt: {}", err),
            })?,
            None => BTreeMap::new(),
        };
        if let Some(id) = ids.get(name) {
            return Ok(*id);
        }
        let id = ids.values().max().map_or(1, |max| max + 1);
        ids.insert(name.to_string(), id);
        let bytes = serde_json::to_vec(&ids).map_err(|err| TableError::InvalidTable {
            name: name.to_string(),
            reason: err.to_string(),
        })?;
        self.audit.put_sentinel(TABLE_IDS, bytes)?;
        Ok(id)
    }

    /// Store blob bytes under `id`; values reference it as `{"__blob__": id}`
    pub fn put_blob(&self, id: &str, bytes: Vec<u8>) -> TableResult<()> {
        let version = self.env.now();
        Ok(self.blobs.put(id.as_bytes(), bytes, version)?)
    }

    /// Blob bytes
    pub fn get_blob(&self, id: &str) -> TableResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(id.as_bytes())?)
    }

    /// Begin a transaction versioned by this database's clock
    pub fn begin(&self, isolation: Isolation) -> Transaction {
        Transaction::begin(&self.env, isolation)
    }

    /// Run `operation` in a tracked transaction, retrying it on conflict up
    /// to `max_attempts` times.
    pub fn transact<T, F>(&self, max_attempts: usize, mut operation: F) -> TableResult<T>
    where
        F: FnMut(&mut Transaction) -> TableResult<T>,
    {
        for _ in 0..max_attempts {
            let mut txn = self.begin(Isolation::Tracked);
            let output = operation(&mut txn)?;
            if txn.commit()? {
                return Ok(output);
            }
        }
        Err(TableError::RetriesExhausted {
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> Arc<Database> {
        Database::in_memory("app", RetentionPolicy::default()).unwrap()
    }

    #[test]
    fn test_table_ids_are_stable() {
        let db = db();
        let users = db.table(TableDef::new("users")).unwrap();
        let orders = db.table(TableDef::new("orders")).unwrap();
        assert_eq!(users.id(), 1);
        assert_eq!(orders.id(), 2);
        assert_eq!(db.table(TableDef::new("users")).unwrap().id(), 1);
        assert_eq!(db.table_by_id(2).unwrap().name(), "orders");
    }

    #[test]
    fn test_empty_table_name_rejected() {
        let err = db().table(TableDef::new("")).err().unwrap();
        assert!(matches!(err, TableError::InvalidTable { .. }));
    }

    #[test]
    fn test_transact_retries_until_commit() {
        let db = db();
        let table = db.table(TableDef::new("counters")).unwrap();
        let mut attempts = 0;
        db.transact(3, |txn| {
            attempts += 1;
            table.get(txn, "c")?;
            if attempts == 1 {
                // A concurrent writer invalidates the first attempt's read.
                db.transact(1, |other| table.put(other, "c", json!({"n": 1}), &Default::default()))?;
            }
            table.put(txn, "c", json!({"n": 2}), &Default::default())
        })
        .unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(table.get_value("c").unwrap(), Some(json!({"n": 2})));
    }

    #[test]
    fn test_transact_gives_up() {
        let db = db();
        let table = db.table(TableDef::new("t")).unwrap();
        let err = db
            .transact(2, |txn| {
                table.get(txn, "k")?;
                db.transact(1, |other| table.put(other, "k", json!(1), &Default::default()))?;
                table.put(txn, "k", json!(2), &Default::default())
            })
            .unwrap_err();
        assert!(matches!(err, TableError::RetriesExhausted { attempts: 2 }));
    }

    #[test]
    fn test_blobs() {
        let db = db();
        db.put_blob("b1", b"bytes".to_vec()).unwrap();
        assert_eq!(db.get_blob("b1").unwrap(), Some(b"bytes".to_vec()));
        assert_eq!(db.get_blob("b2").unwrap(), None);
    }
}
