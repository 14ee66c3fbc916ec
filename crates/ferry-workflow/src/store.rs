//! Migration state storage
//!
//! This module defines the trait for persisting migration records and
//! transaction manifests. The store is the only state shared across a
//! reboot, so implementations must make every write durable before
//! returning.

use async_trait::async_trait;
use ferry_model::{MigrationRecord, Transaction};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Storage error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Trait for migration state persistence
///
/// One record per device, keyed by device ID. Transactions are keyed by
/// their ID and carry the device they belong to.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get the record for a device
    async fn get_record(&self, device_id: &str) -> Result<Option<MigrationRecord>>;

    /// Save a record (create or overwrite)
    async fn put_record(&self, record: &MigrationRecord) -> Result<()>;

    /// List all live records
    async fn list_records(&self) -> Result<Vec<MigrationRecord>>;

    /// Delete a device's record
    async fn delete_record(&self, device_id: &str) -> Result<()>;

    /// Move a device's record to the archive, returning it
    async fn archive_record(&self, device_id: &str) -> Result<Option<MigrationRecord>>;

    /// Archived records for a device, oldest first
    async fn list_archived(&self, device_id: &str) -> Result<Vec<MigrationRecord>>;

    /// Get a transaction manifest
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>>;

    /// Save a transaction manifest
    async fn put_transaction(&self, tx: &Transaction) -> Result<()>;

    /// List all transaction manifests
    async fn list_transactions(&self) -> Result<Vec<Transaction>>;

    /// Delete a transaction manifest
    async fn delete_transaction(&self, id: Uuid) -> Result<()>;

    /// The open transaction for a device, if any
    async fn open_transaction_for(&self, device_id: &str) -> Result<Option<Transaction>> {
        Ok(self
            .list_transactions()
            .await?
            .into_iter()
            .find(|tx| tx.device_id == device_id && tx.is_open()))
    }
}

pub(crate) fn check_record(record: &MigrationRecord) -> Result<()> {
    record
        .validate()
        .map_err(|e| StoreError::InvalidData(e.to_string()))
}

/// Archive key: device ID plus creation time, so archives sort by age
pub(crate) fn archive_key(record: &MigrationRecord) -> String {
    format!(
        "{}/{}",
        record.device_id,
        record.started_at.format("%Y%m%dT%H%M%S%.6fZ")
    )
}

/// In-memory state store for testing
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<String, MigrationRecord>>,
    archive: RwLock<HashMap<String, MigrationRecord>>,
    transactions: RwLock<HashMap<Uuid, Transaction>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_record(&self, device_id: &str) -> Result<Option<MigrationRecord>> {
        Ok(self.records.read().unwrap().get(device_id).cloned())
    }

    async fn put_record(&self, record: &MigrationRecord) -> Result<()> {
        check_record(record)?;
        self.records
            .write()
            .unwrap()
            .insert(record.device_id.clone(), record.clone());
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<MigrationRecord>> {
        Ok(self.records.read().unwrap().values().cloned().collect())
    }

    async fn delete_record(&self, device_id: &str) -> Result<()> {
        self.records.write().unwrap().remove(device_id);
        Ok(())
    }

    async fn archive_record(&self, device_id: &str) -> Result<Option<MigrationRecord>> {
        let Some(record) = self.records.write().unwrap().remove(device_id) else {
            return Ok(None);
        };
        self.archive
            .write()
            .unwrap()
            .insert(archive_key(&record), record.clone());
        Ok(Some(record))
    }

    async fn list_archived(&self, device_id: &str) -> Result<Vec<MigrationRecord>> {
        let mut archived: Vec<MigrationRecord> = self
            .archive
            .read()
            .unwrap()
            .values()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        archived.sort_by_key(|r| r.started_at);
        Ok(archived)
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.transactions.read().unwrap().get(&id).cloned())
    }

    async fn put_transaction(&self, tx: &Transaction) -> Result<()> {
        self.transactions.write().unwrap().insert(tx.id, tx.clone());
        Ok(())
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        let mut txs: Vec<Transaction> =
            self.transactions.read().unwrap().values().cloned().collect();
        txs.sort_by_key(|tx| tx.opened_at);
        Ok(txs)
    }

    async fn delete_transaction(&self, id: Uuid) -> Result<()> {
        self.transactions.write().unwrap().remove(&id);
        Ok(())
    }
}
