//! ReDB storage backend
//!
//! Local embedded database under `localStatePath`. Every write commits
//! with redb's default immediate durability, so a record is on disk before
//! the controller registers a continuation or requests a restart. redb
//! also holds an exclusive lock on the file for as long as it is open,
//! which keeps a second `migrate` process from interleaving writes.

use crate::store::{archive_key, check_record, Result, StateStore, StoreError};
use async_trait::async_trait;
use ferry_model::{MigrationRecord, Transaction};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

const RECORD_TABLE: Table = TableDefinition::new("records");
const ARCHIVE_TABLE: Table = TableDefinition::new("archived_records");
const TRANSACTION_TABLE: Table = TableDefinition::new("transactions");

/// ReDB storage backend
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let db = Database::create(path)
            .map_err(|e| StoreError::Database(format!("failed to open database: {}", e)))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| StoreError::Database(format!("failed to begin transaction: {}", e)))?;
        for table in [RECORD_TABLE, ARCHIVE_TABLE, TRANSACTION_TABLE] {
            write_txn.open_table(table).map_err(|e| {
                StoreError::Database(format!("failed to create table: {}", e))
            })?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(format!("failed to commit: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
    ) -> Result<Option<T>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Database(format!("failed to begin read: {}", e)))?;
        let table = read_txn
            .open_table(table)
            .map_err(|e| StoreError::Database(format!("failed to open table: {}", e)))?;

        match table.get(key) {
            Ok(Some(value)) => {
                let item = serde_json::from_slice(value.value()).map_err(|e| {
                    StoreError::Serialization(format!("failed to deserialize: {}", e))
                })?;
                Ok(Some(item))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Database(format!("get failed: {}", e))),
        }
    }

    fn put<T: Serialize>(
        &self,
        table: Table,
        key: &str,
        item: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(item)
            .map_err(|e| StoreError::Serialization(format!("failed to serialize: {}", e)))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Database(format!("failed to begin write: {}", e)))?;
        {
            let mut table = write_txn
                .open_table(table)
                .map_err(|e| StoreError::Database(format!("failed to open table: {}", e)))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| StoreError::Database(format!("insert failed: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(format!("commit failed: {}", e)))?;
        Ok(())
    }

    fn remove(&self, table: Table, key: &str) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Database(format!("failed to begin write: {}", e)))?;
        {
            let mut table = write_txn
                .open_table(table)
                .map_err(|e| StoreError::Database(format!("failed to open table: {}", e)))?;
            table
                .remove(key)
                .map_err(|e| StoreError::Database(format!("remove failed: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(format!("commit failed: {}", e)))?;
        Ok(())
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Database(format!("failed to begin read: {}", e)))?;
        let table = read_txn
            .open_table(table)
            .map_err(|e| StoreError::Database(format!("failed to open table: {}", e)))?;

        let mut results = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| StoreError::Database(format!("iter failed: {}", e)))?
        {
            let (_, value) = entry
                .map_err(|e| StoreError::Database(format!("entry read failed: {}", e)))?;
            let item = serde_json::from_slice(value.value()).map_err(|e| {
                StoreError::Serialization(format!("failed to deserialize: {}", e))
            })?;
            results.push(item);
        }
        Ok(results)
    }
}

#[async_trait]
impl StateStore for RedbStateStore {
    async fn get_record(&self, device_id: &str) -> Result<Option<MigrationRecord>> {
        self.get(RECORD_TABLE, device_id)
    }

    async fn put_record(&self, record: &MigrationRecord) -> Result<()> {
        check_record(record)?;
        self.put(RECORD_TABLE, &record.device_id, record)
    }

    async fn list_records(&self) -> Result<Vec<MigrationRecord>> {
        self.list(RECORD_TABLE)
    }

    async fn delete_record(&self, device_id: &str) -> Result<()> {
        self.remove(RECORD_TABLE, device_id)
    }

    async fn archive_record(&self, device_id: &str) -> Result<Option<MigrationRecord>> {
        let Some(record) = self.get::<MigrationRecord>(RECORD_TABLE, device_id)? else {
            return Ok(None);
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StoreError::Serialization(format!("failed to serialize: {}", e)))?;
        let key = archive_key(&record);

        // Move in one write transaction so a crash cannot lose or duplicate it
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Database(format!("failed to begin write: {}", e)))?;
        {
            let mut archive = write_txn
                .open_table(ARCHIVE_TABLE)
                .map_err(|e| StoreError::Database(format!("failed to open table: {}", e)))?;
            archive
                .insert(key.as_str(), bytes.as_slice())
                .map_err(|e| StoreError::Database(format!("insert failed: {}", e)))?;
        }
        {
            let mut records = write_txn
                .open_table(RECORD_TABLE)
                .map_err(|e| StoreError::Database(format!("failed to open table: {}", e)))?;
            records
                .remove(device_id)
                .map_err(|e| StoreError::Database(format!("remove failed: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(format!("commit failed: {}", e)))?;

        Ok(Some(record))
    }

    async fn list_archived(&self, device_id: &str) -> Result<Vec<MigrationRecord>> {
        let mut archived: Vec<MigrationRecord> = self
            .list::<MigrationRecord>(ARCHIVE_TABLE)?
            .into_iter()
            .filter(|r| r.device_id == device_id)
            .collect();
        archived.sort_by_key(|r| r.started_at);
        Ok(archived)
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        self.get(TRANSACTION_TABLE, &id.to_string())
    }

    async fn put_transaction(&self, tx: &Transaction) -> Result<()> {
        self.put(TRANSACTION_TABLE, &tx.id.to_string(), tx)
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self.list(TRANSACTION_TABLE)?;
        txs.sort_by_key(|tx| tx.opened_at);
        Ok(txs)
    }

    async fn delete_transaction(&self, id: Uuid) -> Result<()> {
        self.remove(TRANSACTION_TABLE, &id.to_string())
    }
}
