//! Transaction manager
//!
//! Runs a named step with rollback data captured up front. The step asks
//! its `TransactionScope` to back up each component before touching it;
//! the manifest is persisted after every capture so a crash mid-step
//! leaves behind exactly what has to be undone. On error the backups are
//! restored last-captured-first and the original error is returned.

use crate::error::{Result, WorkflowError};
use crate::store::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_actions::{BackupHandler, CapabilityContext};
use ferry_model::{
    BackupEntry, MigrationRecord, ProfileMapping, Stage, Transaction, TransactionStatus,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Work executed inside a transaction
#[async_trait]
pub trait Step: Send + Sync {
    /// Stage the step advances the record to
    fn stage(&self) -> Stage;

    /// Run the step, capturing backups through `scope` before mutating
    async fn execute(&self, scope: &mut TransactionScope<'_>) -> Result<()>;

    /// Copy anything the step learned onto the record after it commits
    fn apply(&self, record: &mut MigrationRecord) {
        let _ = record;
    }
}

/// Handle given to a running step
pub struct TransactionScope<'a> {
    manager: &'a TransactionManager,
    ctx: &'a CapabilityContext,
    tx: Transaction,
}

impl<'a> TransactionScope<'a> {
    pub fn ctx(&self) -> &CapabilityContext {
        self.ctx
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Capture `component` so it can be restored if the step fails
    ///
    /// A component captured earlier in the same transaction (including by
    /// a process that died before finishing the step) is not captured again.
    pub async fn backup(&mut self, component: &str) -> Result<()> {
        if self.tx.backup_for(component).is_some() {
            debug!(
                device = %self.tx.device_id,
                component = %component,
                "Backup already captured, reusing"
            );
            return Ok(());
        }

        let dir = self.manager.transaction_dir(&self.tx);
        tokio::fs::create_dir_all(&dir).await?;
        let location = dir.join(format!("{:02}-{}", self.tx.backups.len() + 1, component));

        self.manager
            .backups
            .capture(self.ctx, component, &location)
            .await?;
        self.tx.append_backup(BackupEntry::new(component, location))?;
        self.manager.store.put_transaction(&self.tx).await?;

        info!(
            device = %self.tx.device_id,
            transaction = %self.tx.id,
            component = %component,
            "Captured backup"
        );
        Ok(())
    }

    /// Persist the discovered user profile in the manifest
    pub async fn remember_profile(&mut self, profile: &ProfileMapping) -> Result<()> {
        if self.tx.profile.as_ref() == Some(profile) {
            return Ok(());
        }
        self.tx.profile = Some(profile.clone());
        self.manager.store.put_transaction(&self.tx).await?;
        debug!(device = %self.tx.device_id, transaction = %self.tx.id, "Recorded user profile");
        Ok(())
    }
}

/// Opens, commits and rolls back per-device transactions
pub struct TransactionManager {
    store: Arc<dyn StateStore>,
    backups: Arc<dyn BackupHandler>,
    backup_root: PathBuf,
    retention: chrono::Duration,
    step_timeout: Option<Duration>,

    /// Devices with a transaction open in this process
    active: Mutex<HashSet<String>>,
}

impl TransactionManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        backups: Arc<dyn BackupHandler>,
        backup_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            backups,
            backup_root: backup_root.into(),
            retention: chrono::Duration::days(30),
            step_timeout: None,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// How long committed backups are kept when retained
    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Bound each step's execution time
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    fn transaction_dir(&self, tx: &Transaction) -> PathBuf {
        self.backup_root.join(tx.id.to_string())
    }

    /// Open a new transaction for a device
    ///
    /// Fails fast if the device already has an open transaction, either in
    /// this process or persisted by an earlier one.
    pub async fn begin(&self, device_id: &str, name: &str) -> Result<Transaction> {
        self.claim(device_id, None)?;

        let persisted = match self.store.open_transaction_for(device_id).await {
            Ok(persisted) => persisted,
            Err(e) => {
                self.release(device_id);
                return Err(e.into());
            }
        };
        if let Some(existing) = persisted {
            self.release(device_id);
            return Err(WorkflowError::TransactionAlreadyOpen {
                device_id: device_id.to_string(),
                transaction_id: Some(existing.id),
            });
        }

        let tx = Transaction::open(device_id, name);
        if let Err(e) = self.store.put_transaction(&tx).await {
            self.release(device_id);
            return Err(e.into());
        }
        debug!(device = %device_id, transaction = %tx.id, name = %name, "Opened transaction");
        Ok(tx)
    }

    /// Take over an open transaction left behind by a process that died
    pub fn adopt(&self, tx: Transaction) -> Result<Transaction> {
        if !tx.is_open() {
            return Err(WorkflowError::InvalidTransactionState {
                id: tx.id,
                status: format!("{:?}", tx.status),
                expected: "Open".to_string(),
            });
        }
        self.claim(&tx.device_id, Some(tx.id))?;
        warn!(
            device = %tx.device_id,
            transaction = %tx.id,
            backups = tx.backups.len(),
            "Adopting open transaction from an interrupted run"
        );
        Ok(tx)
    }

    fn claim(&self, device_id: &str, transaction_id: Option<uuid::Uuid>) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        if !active.insert(device_id.to_string()) {
            return Err(WorkflowError::TransactionAlreadyOpen {
                device_id: device_id.to_string(),
                transaction_id,
            });
        }
        Ok(())
    }

    /// Drop this process's claim on a device without running a step
    pub(crate) fn release(&self, device_id: &str) {
        self.active.lock().unwrap().remove(device_id);
    }

    /// Open a transaction, run `step` in it, and commit or roll back
    pub async fn run(&self, ctx: &CapabilityContext, name: &str, step: &dyn Step) -> Result<Transaction> {
        let tx = self.begin(ctx.device_id(), name).await?;
        self.execute(ctx, tx, step).await
    }

    /// Run `step` inside an already opened (or adopted) transaction
    ///
    /// On success the transaction is committed. On failure it is rolled
    /// back and the step's error is returned, unless restoration itself
    /// failed, in which case `RollbackFailed` is returned.
    pub async fn execute(
        &self,
        ctx: &CapabilityContext,
        tx: Transaction,
        step: &dyn Step,
    ) -> Result<Transaction> {
        let device_id = tx.device_id.clone();
        let result = self.execute_claimed(ctx, tx, step).await;
        self.release(&device_id);
        result
    }

    async fn execute_claimed(
        &self,
        ctx: &CapabilityContext,
        tx: Transaction,
        step: &dyn Step,
    ) -> Result<Transaction> {
        let mut scope = TransactionScope {
            manager: self,
            ctx,
            tx,
        };

        let outcome = match self.step_timeout {
            Some(timeout) => tokio::time::timeout(timeout, step.execute(&mut scope))
                .await
                .unwrap_or(Err(WorkflowError::StageTimeout {
                    stage: step.stage(),
                    timeout,
                })),
            None => step.execute(&mut scope).await,
        };
        let mut tx = scope.tx;

        match outcome {
            Ok(()) => {
                tx.mark_committed();
                self.store.put_transaction(&tx).await?;
                debug!(device = %tx.device_id, transaction = %tx.id, "Committed transaction");
                Ok(tx)
            }
            Err(cause) => {
                warn!(
                    device = %tx.device_id,
                    transaction = %tx.id,
                    error = %cause,
                    "Step failed, rolling back"
                );
                match self.rollback(ctx, &mut tx).await {
                    Ok(()) => Err(cause),
                    Err(WorkflowError::RollbackFailed {
                        transaction_id,
                        failures,
                        ..
                    }) => Err(WorkflowError::RollbackFailed {
                        transaction_id,
                        failures,
                        cause: cause.to_string(),
                    }),
                    Err(other) => Err(other),
                }
            }
        }
    }

    /// Restore every backup in reverse capture order
    ///
    /// A failed restoration does not stop the remaining ones. Backups are
    /// kept for the retention window either way.
    pub async fn rollback(&self, ctx: &CapabilityContext, tx: &mut Transaction) -> Result<()> {
        let mut failures = Vec::new();
        for entry in tx.rollback_order() {
            match self
                .backups
                .restore(ctx, &entry.component, &entry.location)
                .await
            {
                Ok(()) => {
                    info!(device = %tx.device_id, component = %entry.component, "Restored backup");
                }
                Err(e) => {
                    error!(
                        device = %tx.device_id,
                        component = %entry.component,
                        error = %e,
                        "Failed to restore backup"
                    );
                    failures.push(entry.component.clone());
                }
            }
        }

        tx.mark_rolled_back(failures.clone());
        tx.retain_until = Some(Utc::now() + self.retention);
        self.store.put_transaction(tx).await?;

        if failures.is_empty() {
            info!(device = %tx.device_id, transaction = %tx.id, "Rolled back transaction");
            Ok(())
        } else {
            Err(WorkflowError::RollbackFailed {
                transaction_id: tx.id,
                failures,
                cause: "rollback requested".to_string(),
            })
        }
    }

    /// Finalize a committed transaction
    ///
    /// With `retain_backups` the manifest and files are kept until the
    /// retention window passes; otherwise they are deleted now.
    pub async fn complete(&self, tx: &mut Transaction, retain_backups: bool) -> Result<()> {
        if tx.status != TransactionStatus::Committed {
            return Err(WorkflowError::InvalidTransactionState {
                id: tx.id,
                status: format!("{:?}", tx.status),
                expected: "Committed".to_string(),
            });
        }

        if retain_backups && !tx.backups.is_empty() {
            tx.retain_until = Some(Utc::now() + self.retention);
            self.store.put_transaction(tx).await?;
        } else {
            self.discard(tx).await?;
        }
        Ok(())
    }

    /// Delete retained transactions whose window has passed
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut pruned = 0;
        for tx in self.store.list_transactions().await? {
            if tx.is_expired(now) {
                self.discard(&tx).await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "Pruned expired backups");
        }
        Ok(pruned)
    }

    /// Delete every closed transaction for a device, regardless of retention
    pub async fn purge_device(&self, device_id: &str) -> Result<usize> {
        let mut purged = 0;
        for tx in self.store.list_transactions().await? {
            if tx.device_id == device_id && !tx.is_open() {
                self.discard(&tx).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn discard(&self, tx: &Transaction) -> Result<()> {
        let dir = self.transaction_dir(tx);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_transaction(tx.id).await?;
        debug!(transaction = %tx.id, "Discarded transaction backups");
        Ok(())
    }
}
