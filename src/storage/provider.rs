//! Pluggable key/value storage providers
//!
//! The pipeline only needs four operations over string keys and byte values.
//! Production uses redb; tests use the in-memory provider.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::ShareResult;

const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// External storage contract: a flat key/value store with prefix listing.
pub trait StorageProvider: Send + Sync {
    /// Read a value, `None` if absent
    fn get(&self, key: &str) -> ShareResult<Option<Vec<u8>>>;
    /// Write a value atomically
    fn put(&self, key: &str, value: &[u8]) -> ShareResult<()>;
    /// Delete a value; absent keys are not an error
    fn remove(&self, key: &str) -> ShareResult<()>;
    /// List all keys starting with `prefix`
    fn list(&self, prefix: &str) -> ShareResult<Vec<String>>;
}

/// ACID-compliant provider backed by redb.
#[derive(Clone)]
pub struct RedbProvider {
    db: Arc<RwLock<Database>>,
}

impl RedbProvider {
    /// Open or create a database at the given path.
    ///
    /// Creates the parent directory if needed and initializes the table.
    pub fn new(path: impl AsRef<Path>) -> ShareResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(BLOBS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl StorageProvider for RedbProvider {
    fn get(&self, key: &str) -> ShareResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> ShareResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> ShareResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOBS_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> ShareResult<Vec<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BLOBS_TABLE)?;

        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            let key = key.value();
            if key.starts_with(prefix) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}

/// In-memory provider for tests and ephemeral sessions.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryProvider {
    /// Create an empty in-memory provider
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageProvider for MemoryProvider {
    fn get(&self, key: &str) -> ShareResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> ShareResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> ShareResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> ShareResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
