//! Transaction and backup manifest types

use crate::{ModelError, ProfileMapping, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Rollback-scoped unit of work for one stage execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,

    /// Device the transaction mutates
    pub device_id: String,

    /// Name of the step running inside the transaction
    pub name: String,

    pub opened_at: DateTime<Utc>,

    pub status: TransactionStatus,

    /// Backups in capture order; rollback walks them in reverse
    #[serde(default)]
    pub backups: Vec<BackupEntry>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    /// Backups are kept for manual recovery until this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain_until: Option<DateTime<Utc>>,

    /// Components whose restoration failed during rollback
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restore_failures: Vec<String>,

    /// User profile read by the step before it removed the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileMapping>,
}

impl Transaction {
    /// Open a new transaction
    pub fn open(device_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            name: name.into(),
            opened_at: Utc::now(),
            status: TransactionStatus::Open,
            backups: Vec::new(),
            closed_at: None,
            retain_until: None,
            restore_failures: Vec::new(),
            profile: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TransactionStatus::Open
    }

    /// Find the backup already captured for `component`
    pub fn backup_for(&self, component: &str) -> Option<&BackupEntry> {
        self.backups.iter().find(|b| b.component == component)
    }

    /// Append a backup; only allowed while the transaction is open
    pub fn append_backup(&mut self, entry: BackupEntry) -> Result<()> {
        if !self.is_open() {
            return Err(ModelError::InvalidFieldValue {
                field: "backups".to_string(),
                message: format!("transaction {} is {:?}", self.id, self.status),
            });
        }
        if self.backup_for(&entry.component).is_some() {
            return Err(ModelError::InvalidFieldValue {
                field: "backups".to_string(),
                message: format!("component '{}' already captured", entry.component),
            });
        }
        self.backups.push(entry);
        Ok(())
    }

    /// Backups in restoration order (last captured, first restored)
    pub fn rollback_order(&self) -> impl Iterator<Item = &BackupEntry> {
        self.backups.iter().rev()
    }

    pub fn mark_committed(&mut self) {
        self.status = TransactionStatus::Committed;
        self.closed_at = Some(Utc::now());
    }

    pub fn mark_rolled_back(&mut self, restore_failures: Vec<String>) {
        self.status = TransactionStatus::RolledBack;
        self.closed_at = Some(Utc::now());
        self.restore_failures = restore_failures;
    }

    /// Whether retained backups may be discarded
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_open() && self.retain_until.map(|until| until <= now).unwrap_or(true)
    }
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransactionStatus {
    Open,
    Committed,
    RolledBack,
}

/// One captured component
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    /// Logical component name (e.g. `source-management`)
    pub component: String,

    /// Where the captured data was written
    pub location: PathBuf,

    pub captured_at: DateTime<Utc>,
}

impl BackupEntry {
    pub fn new(component: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            component: component.into(),
            location: location.into(),
            captured_at: Utc::now(),
        }
    }
}
