use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::errors::{Error, Result};

// One durable table per entity, keyed by record id.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");
pub const MIGRATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("migrations");
pub const SUBSCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscriptions");
pub const DEAD_LETTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("dead_letters");

/// Embedded record store backed by redb. Values are serde_json bytes so the
/// record types keep their serde derives as the single schema definition.
pub struct RecordStore {
    db: Arc<Database>,
}

fn storage_err(err: impl std::fmt::Display) -> Error {
    Error::Storage(err.to_string())
}

impl RecordStore {
    /// Open or create the database, making sure every table exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(storage_err)?;

        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            for table in [TASKS, HOSTS, MIGRATIONS, SUBSCRIPTIONS, DEAD_LETTERS] {
                write_txn.open_table(table).map_err(storage_err)?;
            }
        }
        write_txn.commit().map_err(storage_err)?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        id: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(table).map_err(storage_err)?;
            table.insert(id, bytes.as_slice()).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        id: &str,
    ) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(table).map_err(storage_err)?;
        match table.get(id).map_err(storage_err)? {
            Some(val) => Ok(Some(serde_json::from_slice(val.value())?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, table: TableDefinition<&str, &[u8]>, id: &str) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(table).map_err(storage_err)?;
            table.remove(id).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    pub fn list<T: DeserializeOwned>(&self, table: TableDefinition<&str, &[u8]>) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(table).map_err(storage_err)?;

        let mut records = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let entry = entry.map_err(storage_err)?;
            records.push(serde_json::from_slice(entry.1.value())?);
        }
        Ok(records)
    }
}
