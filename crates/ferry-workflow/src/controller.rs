//! Stage controller
//!
//! Owns the per-device state machine. Each `resume` call reads the record,
//! runs stage work until it reaches a reboot boundary or a terminal stage,
//! and persists after every transition. At a reboot boundary the record is
//! written first and the continuation registered second, so a crash in
//! between leaves a record that the next `resume` can repair.

use crate::error::{Result, WorkflowError};
use crate::stages::step_for;
use crate::store::StateStore;
use crate::transaction::TransactionManager;
use crate::verification::{required_checks, Check, RetryPolicy, VerificationEngine};
use chrono::Utc;
use ferry_actions::{Capabilities, CapabilityBackups, CapabilityContext, Continuation};
use ferry_model::{
    ErrorKind, MigrationConfig, MigrationError, MigrationRecord, RebootMarker, Stage, Transaction,
    VerificationResult,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Event emitted as a device moves through its stages
#[derive(Debug, Clone)]
pub enum MigrationEvent {
    /// Work towards `stage` began
    StageStarted {
        device_id: String,
        stage: Stage,
        attempt: u32,
    },
    /// The record advanced to `stage`
    StageCompleted { device_id: String, stage: Stage },
    /// Suspended until the device restarts
    AwaitingReboot { device_id: String, stage: Stage },
    /// A step failed and its changes were restored
    RolledBack {
        device_id: String,
        stage: Stage,
        error: String,
    },
    /// The device ended in `Failed`
    Failed {
        device_id: String,
        stage: Stage,
        error: String,
    },
    /// A verification pass finished
    VerificationCompleted {
        device_id: String,
        success: bool,
    },
}

/// Where a `resume` call left the device
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeOutcome {
    pub device_id: String,
    pub stage: Stage,

    /// Suspended at a reboot boundary
    pub awaiting_reboot: bool,

    /// Result of the verification pass run by this call, if any
    pub verification: Option<VerificationResult>,
}

impl ResumeOutcome {
    fn at(record: &MigrationRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            stage: record.stage,
            awaiting_reboot: record.is_awaiting_reboot(),
            verification: None,
        }
    }

    /// Verification ran and failed
    pub fn verification_failed(&self) -> bool {
        self.verification
            .as_ref()
            .is_some_and(|v| !v.overall_success)
    }

    /// The device has nothing left to do
    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Drives one device at a time through the migration stages
pub struct StageController {
    store: Arc<dyn StateStore>,
    capabilities: Arc<dyn Capabilities>,
    continuation: Arc<dyn Continuation>,
    transactions: TransactionManager,
    verifier: VerificationEngine,
    checks: Vec<Arc<dyn Check>>,

    max_attempts: u32,
    retain_backups: bool,
    skip_verification: bool,
    call_timeout: Duration,

    /// Serializes resumes for the same device within this process
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancelled: Mutex<HashSet<String>>,
    event_sender: broadcast::Sender<MigrationEvent>,
}

impl StageController {
    pub fn new(
        config: &MigrationConfig,
        store: Arc<dyn StateStore>,
        capabilities: Arc<dyn Capabilities>,
        continuation: Arc<dyn Continuation>,
    ) -> Self {
        let transactions = TransactionManager::new(
            store.clone(),
            Arc::new(CapabilityBackups::new(capabilities.clone())),
            config.backup_root(),
        )
        .with_retention(config.retention())
        .with_step_timeout(config.stage_timeout());

        let (event_sender, _) = broadcast::channel(1024);
        Self {
            checks: required_checks(&capabilities, config),
            store,
            capabilities,
            continuation,
            transactions,
            verifier: VerificationEngine::new(RetryPolicy::from(&config.verification))
                .with_call_timeout(config.stage_timeout()),
            max_attempts: config.max_stage_attempts.max(1),
            retain_backups: config.retain_backups,
            skip_verification: config.skip_verification,
            call_timeout: config.stage_timeout(),
            device_locks: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            event_sender,
        }
    }

    /// Override the verification retry policy
    pub fn with_verification_policy(mut self, policy: RetryPolicy) -> Self {
        self.verifier = VerificationEngine::new(policy).with_call_timeout(self.call_timeout);
        self
    }

    /// Complete without running post-migration checks
    pub fn with_skip_verification(mut self, skip: bool) -> Self {
        self.skip_verification = skip;
        self
    }

    /// Subscribe to migration events
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.event_sender.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn capabilities(&self) -> &Arc<dyn Capabilities> {
        &self.capabilities
    }

    pub fn continuation(&self) -> &Arc<dyn Continuation> {
        &self.continuation
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Stop a device before its next stage
    ///
    /// Work already in flight is not interrupted.
    pub fn cancel(&self, device_id: &str) {
        info!(device = %device_id, "Cancellation requested");
        self.cancelled.lock().unwrap().insert(device_id.to_string());
    }

    pub fn is_cancelled(&self, device_id: &str) -> bool {
        self.cancelled.lock().unwrap().contains(device_id)
    }

    /// The persisted record for a device
    pub async fn status(&self, device_id: &str) -> Result<Option<MigrationRecord>> {
        Ok(self.store.get_record(device_id).await?)
    }

    fn emit(&self, event: MigrationEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Context for a capability call, bounded by the stage timeout
    pub fn context(&self, device_id: &str) -> CapabilityContext {
        CapabilityContext::new(device_id).with_timeout(self.call_timeout)
    }

    fn device_lock(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.device_locks
            .lock()
            .unwrap()
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Continue a device's migration from wherever its record says
    ///
    /// Creates the record at `Preparation` on first use. Returns once the
    /// device is suspended for a reboot, completed, or verification failed.
    /// A step failure is returned as an error after the record has been
    /// moved to `RolledBack` or `Failed`.
    pub async fn resume(&self, device_id: &str) -> Result<ResumeOutcome> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let mut record = match self.store.get_record(device_id).await? {
            Some(record) => record,
            None => {
                info!(device = %device_id, "Starting new migration");
                let record = MigrationRecord::new(device_id);
                self.store.put_record(&record).await?;
                record
            }
        };

        if record.stage.is_terminal() {
            debug!(device = %device_id, stage = %record.stage, "Nothing to resume");
            return Ok(ResumeOutcome::at(&record));
        }

        if record.is_awaiting_reboot() && !self.cross_reboot_boundary(&mut record).await? {
            return Ok(ResumeOutcome::at(&record));
        }

        let ctx = self.context(device_id);
        if has_transactional_work(record.stage) {
            if let Err(e) = self.capabilities.preflight(&ctx).await {
                let err = WorkflowError::Preflight(e);
                warn!(device = %device_id, error = %err, "Preflight failed, nothing was changed");
                record.record_error(MigrationError::new(err.kind(), record.stage, err.to_string()));
                self.store.put_record(&record).await?;
                return Err(err);
            }
        }

        loop {
            if self.is_cancelled(device_id) {
                let err = WorkflowError::Cancelled(device_id.to_string());
                record.record_error(MigrationError::new(
                    ErrorKind::Cancelled,
                    record.stage,
                    err.to_string(),
                ));
                self.store.put_record(&record).await?;
                return Err(err);
            }

            match record.stage {
                Stage::Completed | Stage::Failed | Stage::RolledBack => {
                    return Ok(ResumeOutcome::at(&record));
                }
                Stage::Finalize => {
                    let next = if self.skip_verification {
                        Stage::Completed
                    } else {
                        Stage::Verification
                    };
                    self.advance(&mut record, next).await?;
                }
                Stage::Verification => {
                    return self.verify(&mut record).await;
                }
                from => {
                    let to = self.run_stage(&ctx, &mut record, from).await?;
                    if to == Stage::Finalize {
                        self.prune_backups().await;
                    }
                    if to.requires_reboot_after() {
                        self.suspend(&mut record).await?;
                        return Ok(ResumeOutcome::at(&record));
                    }
                }
            }
        }
    }

    /// Returns true when the device has restarted since it suspended
    async fn cross_reboot_boundary(&self, record: &mut MigrationRecord) -> Result<bool> {
        let device_id = record.device_id.clone();
        let current = self.continuation.boot_id(&device_id).await?;
        let since = record
            .awaiting_reboot
            .as_ref()
            .map(|m| m.boot_id.clone())
            .unwrap_or_default();

        if current == since {
            // Repair a crash between persisting the marker and registering
            let registered = self
                .continuation
                .is_registered(&device_id)
                .await
                .unwrap_or(false);
            if !registered {
                if let Some(next) = record.stage.next() {
                    self.continuation.register(&device_id, next).await?;
                }
            }
            debug!(device = %device_id, stage = %record.stage, "Still waiting for restart");
            self.emit(MigrationEvent::AwaitingReboot {
                device_id,
                stage: record.stage,
            });
            return Ok(false);
        }

        self.continuation.consume(&device_id).await?;
        record.awaiting_reboot = None;
        record.touch();
        self.store.put_record(record).await?;
        info!(device = %device_id, stage = %record.stage, "Resumed after restart");
        Ok(true)
    }

    /// Persist the reboot marker, then register the continuation
    async fn suspend(&self, record: &mut MigrationRecord) -> Result<()> {
        let device_id = record.device_id.clone();
        let boot_id = self.continuation.boot_id(&device_id).await?;
        record.awaiting_reboot = Some(RebootMarker {
            boot_id,
            since: Utc::now(),
        });
        record.touch();
        self.store.put_record(record).await?;

        if let Some(next) = record.stage.next() {
            self.continuation.register(&device_id, next).await?;
        }
        info!(device = %device_id, stage = %record.stage, "Suspended until restart");
        self.emit(MigrationEvent::AwaitingReboot {
            device_id,
            stage: record.stage,
        });
        Ok(())
    }

    async fn advance(&self, record: &mut MigrationRecord, to: Stage) -> Result<()> {
        let from = record.stage;
        record.advance_to(to)?;
        self.store.put_record(record).await?;
        info!(device = %record.device_id, from = %from, to = %to, "Stage completed");
        self.emit(MigrationEvent::StageCompleted {
            device_id: record.device_id.clone(),
            stage: to,
        });
        Ok(())
    }

    /// Run the transactional work out of `from`, retrying transient errors
    async fn run_stage(
        &self,
        ctx: &CapabilityContext,
        record: &mut MigrationRecord,
        from: Stage,
    ) -> Result<Stage> {
        self.recover_profile(record).await?;
        let step = step_for(from, record, self.capabilities.clone())
            .ok_or(ferry_model::ModelError::InvalidStageTransition { from, to: from })?;
        let to = step.stage();

        loop {
            record.attempts += 1;
            record.touch();
            self.store.put_record(record).await?;
            info!(device = %record.device_id, stage = %to, attempt = record.attempts, "Starting stage");
            self.emit(MigrationEvent::StageStarted {
                device_id: record.device_id.clone(),
                stage: to,
                attempt: record.attempts,
            });

            let tx = self.open_transaction(record, to).await?;
            if let Err(e) = self.attach(record, &tx).await {
                self.transactions.release(&tx.device_id);
                return Err(e);
            }

            let result = self.transactions.execute(ctx, tx, step.as_ref()).await;
            record.detach_transaction();

            let err = match result {
                Ok(mut tx) => {
                    step.apply(record);
                    self.advance(record, to).await?;
                    if let Err(e) = self.transactions.complete(&mut tx, self.retain_backups).await {
                        warn!(device = %record.device_id, error = %e, "Failed to finalize transaction");
                    }
                    return Ok(to);
                }
                Err(err) => err,
            };

            let kind = err.kind();
            if kind == ErrorKind::Transient && record.attempts < self.max_attempts {
                warn!(
                    device = %record.device_id,
                    stage = %to,
                    attempt = record.attempts,
                    error = %err,
                    "Transient failure, retrying stage"
                );
                record.record_error(MigrationError::new(kind, from, err.to_string()));
                self.store.put_record(record).await?;
                continue;
            }

            let terminal = match kind {
                ErrorKind::RollbackFailure | ErrorKind::Transient => Stage::Failed,
                _ => Stage::RolledBack,
            };
            let failure = MigrationError::new(kind, from, err.to_string())
                .with_details(err.restore_failures().to_vec());
            record.fail(terminal, failure)?;
            self.store.put_record(record).await?;

            error!(
                device = %record.device_id,
                stage = %to,
                outcome = %terminal,
                error = %err,
                "Stage failed"
            );
            let event = if terminal == Stage::RolledBack {
                MigrationEvent::RolledBack {
                    device_id: record.device_id.clone(),
                    stage: from,
                    error: err.to_string(),
                }
            } else {
                MigrationEvent::Failed {
                    device_id: record.device_id.clone(),
                    stage: from,
                    error: err.to_string(),
                }
            };
            self.emit(event);
            return Err(err);
        }
    }

    /// Reuse an open transaction left by an interrupted run, or open one
    async fn open_transaction(&self, record: &mut MigrationRecord, to: Stage) -> Result<Transaction> {
        let mut orphan = match record.transaction_id {
            Some(id) => self
                .store
                .get_transaction(id)
                .await?
                .filter(Transaction::is_open),
            None => None,
        };
        if orphan.is_none() {
            orphan = self.store.open_transaction_for(&record.device_id).await?;
        }

        match orphan {
            Some(tx) => {
                // The record may still name an older, already closed transaction
                if record.transaction_id != Some(tx.id) {
                    record.detach_transaction();
                }
                self.transactions.adopt(tx)
            }
            None => {
                record.detach_transaction();
                self.transactions
                    .begin(&record.device_id, to.as_str())
                    .await
            }
        }
    }

    /// Take the profile from a transaction that closed before the record
    /// caught up with it
    async fn recover_profile(&self, record: &mut MigrationRecord) -> Result<()> {
        if record.profile.is_some() {
            return Ok(());
        }
        let Some(id) = record.transaction_id else {
            return Ok(());
        };
        if let Some(tx) = self.store.get_transaction(id).await? {
            if tx.profile.is_some() {
                debug!(device = %record.device_id, transaction = %id, "Recovered user profile");
                record.profile = tx.profile;
            }
        }
        Ok(())
    }

    async fn attach(&self, record: &mut MigrationRecord, tx: &Transaction) -> Result<()> {
        record.attach_transaction(tx.id)?;
        self.store.put_record(record).await?;
        Ok(())
    }

    async fn verify(&self, record: &mut MigrationRecord) -> Result<ResumeOutcome> {
        let result = self.verifier.verify(&record.device_id, &self.checks).await;
        self.emit(MigrationEvent::VerificationCompleted {
            device_id: record.device_id.clone(),
            success: result.overall_success,
        });

        if result.overall_success {
            self.advance(record, Stage::Completed).await?;
        } else {
            // Report only; the source is already gone, so no rollback
            record.record_error(
                MigrationError::new(
                    ErrorKind::VerificationFailure,
                    Stage::Verification,
                    "post-migration checks failed",
                )
                .with_details(
                    result
                        .failed_checks()
                        .map(|c| format!("{}: {}", c.name, c.detail))
                        .collect(),
                ),
            );
            self.store.put_record(record).await?;
        }

        let mut outcome = ResumeOutcome::at(record);
        outcome.verification = Some(result);
        Ok(outcome)
    }

    async fn prune_backups(&self) {
        if let Err(e) = self.transactions.prune_expired(Utc::now()).await {
            warn!(error = %e, "Failed to prune expired backups");
        }
    }
}

fn has_transactional_work(stage: Stage) -> bool {
    matches!(
        stage,
        Stage::Preparation
            | Stage::SourceRemoval
            | Stage::IntermediateBoot
            | Stage::TargetEnrollment
            | Stage::ProfileCapture
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redb_store::RedbStateStore;
    use crate::store::MemoryStateStore;
    use ferry_actions::{ErrorClass, ScriptedCapabilities, SimulatedContinuation};
    use ferry_model::{Backoff, ProfileMapping, TransactionStatus};

    const DEVICE: &str = "LAPTOP-042";

    struct Harness {
        store: Arc<dyn StateStore>,
        caps: Arc<ScriptedCapabilities>,
        continuation: Arc<SimulatedContinuation>,
        controller: StageController,
        config: MigrationConfig,
        _dir: tempfile::TempDir,
    }

    fn config(dir: &tempfile::TempDir) -> MigrationConfig {
        MigrationConfig {
            local_state_path: dir.path().to_path_buf(),
            required_applications: vec!["Company Portal".to_string()],
            ..Default::default()
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Backoff::Fixed)
    }

    fn harness(caps: ScriptedCapabilities) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let caps = Arc::new(caps.with_installed_app("Company Portal"));
        let continuation = Arc::new(SimulatedContinuation::new());
        let controller = StageController::new(&config, store.clone(), caps.clone(), continuation.clone())
            .with_verification_policy(fast_policy());
        Harness {
            store,
            caps,
            continuation,
            controller,
            config,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_first_resume_suspends_after_source_removal() {
        let h = harness(ScriptedCapabilities::new().with_profile("S-1-5-21-7", "AzureAD\\jdoe"));

        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::SourceRemoval);
        assert!(outcome.awaiting_reboot);
        assert!(!h.caps.is_source_present(DEVICE));
        assert_eq!(
            h.continuation.registered_stage(DEVICE),
            Some(Stage::IntermediateBoot)
        );

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::SourceRemoval);
        assert!(record.transaction_id.is_none());
        assert_eq!(record.profile.unwrap().source_sid, "S-1-5-21-7");
    }

    #[tokio::test]
    async fn test_resume_is_idempotent_within_a_boot() {
        let h = harness(ScriptedCapabilities::new());

        let first = h.controller.resume(DEVICE).await.unwrap();
        let second = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(first.stage, second.stage);
        assert!(second.awaiting_reboot);

        assert_eq!(h.caps.captured(DEVICE), vec!["source-management"]);
        assert_eq!(h.caps.call_count(DEVICE, "removeSourceManagement"), 1);
        assert_eq!(h.store.list_transactions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_boot_resume_repairs_missing_continuation() {
        let h = harness(ScriptedCapabilities::new());
        h.controller.resume(DEVICE).await.unwrap();

        // Crash after persisting the marker but before the trigger existed
        h.continuation.consume(DEVICE).await.unwrap();
        h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(
            h.continuation.registered_stage(DEVICE),
            Some(Stage::IntermediateBoot)
        );
    }

    #[tokio::test]
    async fn test_end_to_end_across_reboots() {
        let h = harness(ScriptedCapabilities::new().with_profile("S-1-5-21-7", "AzureAD\\jdoe"));
        let mut events = h.controller.subscribe();

        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::SourceRemoval);

        h.continuation.simulate_reboot();
        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::TargetEnrollment);
        assert!(outcome.awaiting_reboot);
        // The first trigger was consumed, a new one registered
        assert_eq!(
            h.continuation.registered_stage(DEVICE),
            Some(Stage::ProfileCapture)
        );
        assert!(h.caps.is_enrolled(DEVICE));

        h.continuation.simulate_reboot();
        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::Completed);
        assert!(!outcome.awaiting_reboot);
        let verification = outcome.verification.unwrap();
        assert!(verification.overall_success);
        assert!(h.caps.is_profile_transferred(DEVICE));
        assert!(!h.continuation.is_registered(DEVICE).await.unwrap());

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        let path: Vec<Stage> = record.history.iter().map(|t| t.to).collect();
        assert_eq!(path, Stage::FORWARD[1..].to_vec());

        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let MigrationEvent::StageCompleted { stage, .. } = event {
                completed.push(stage);
            }
        }
        assert_eq!(completed.last(), Some(&Stage::Completed));

        // Resuming a completed device does nothing
        let again = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(again.stage, Stage::Completed);
        assert!(again.verification.is_none());
    }

    #[tokio::test]
    async fn test_resume_after_process_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let caps = Arc::new(ScriptedCapabilities::new().with_installed_app("Company Portal"));
        let continuation = Arc::new(SimulatedContinuation::new());

        {
            let store: Arc<dyn StateStore> =
                Arc::new(RedbStateStore::open(config.store_path()).unwrap());
            let controller =
                StageController::new(&config, store, caps.clone(), continuation.clone());
            let outcome = controller.resume(DEVICE).await.unwrap();
            assert_eq!(outcome.stage, Stage::SourceRemoval);
        }

        // New process, new boot
        continuation.simulate_reboot();
        let store: Arc<dyn StateStore> =
            Arc::new(RedbStateStore::open(config.store_path()).unwrap());
        let controller = StageController::new(&config, store.clone(), caps.clone(), continuation);
        let outcome = controller.resume(DEVICE).await.unwrap();

        assert_eq!(outcome.stage, Stage::TargetEnrollment);
        assert_eq!(caps.call_count(DEVICE, "removeSourceManagement"), 1);
        assert_eq!(caps.call_count(DEVICE, "prepareTargetEnrollment"), 1);
        let record = store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.history[0].from, Stage::Preparation);
        assert_eq!(record.history.len(), 3);
    }

    #[tokio::test]
    async fn test_step_failure_rolls_back() {
        let h = harness(ScriptedCapabilities::new().fail(
            "enrollTargetManagement",
            ErrorClass::StepFailure,
        ));
        let mut events = h.controller.subscribe();

        h.controller.resume(DEVICE).await.unwrap();
        h.continuation.simulate_reboot();
        let err = h.controller.resume(DEVICE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StepFailure);

        // Directory join was undone after the enrollment failure
        assert_eq!(
            h.caps.restored(DEVICE),
            vec!["management-enrollment", "directory-membership"]
        );

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::RolledBack);
        assert!(record.transaction_id.is_none());
        let last_error = record.last_error.unwrap();
        assert_eq!(last_error.kind, ErrorKind::StepFailure);
        assert_eq!(last_error.stage, Stage::IntermediateBoot);

        // No further stages run automatically
        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::RolledBack);
        assert_eq!(h.caps.call_count(DEVICE, "enrollTargetManagement"), 1);

        let mut rolled_back = false;
        while let Ok(event) = events.try_recv() {
            rolled_back |= matches!(event, MigrationEvent::RolledBack { .. });
        }
        assert!(rolled_back);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let h = harness(ScriptedCapabilities::new().fail_times(
            "removeSourceManagement",
            1,
            ErrorClass::Transient,
        ));

        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::SourceRemoval);
        assert_eq!(h.caps.call_count(DEVICE, "removeSourceManagement"), 2);

        let mut statuses: Vec<TransactionStatus> = h
            .store
            .list_transactions()
            .await
            .unwrap()
            .into_iter()
            .map(|tx| tx.status)
            .collect();
        statuses.sort_by_key(|s| format!("{:?}", s));
        assert_eq!(
            statuses,
            vec![TransactionStatus::Committed, TransactionStatus::RolledBack]
        );

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_attempts() {
        let h = harness(ScriptedCapabilities::new().fail(
            "removeSourceManagement",
            ErrorClass::Transient,
        ));

        let err = h.controller.resume(DEVICE).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            h.caps.call_count(DEVICE, "removeSourceManagement"),
            h.config.max_stage_attempts as usize
        );

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_rollback_failure_ends_failed() {
        let h = harness(
            ScriptedCapabilities::new()
                .fail("enrollTargetManagement", ErrorClass::StepFailure)
                .fail_restore("directory-membership"),
        );

        h.controller.resume(DEVICE).await.unwrap();
        h.continuation.simulate_reboot();
        let err = h.controller.resume(DEVICE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RollbackFailure);

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Failed);
        let last_error = record.last_error.unwrap();
        assert!(last_error.kind.requires_manual_recovery());
        assert_eq!(last_error.details, vec!["directory-membership".to_string()]);
    }

    #[tokio::test]
    async fn test_preflight_failure_changes_nothing() {
        let h = harness(ScriptedCapabilities::new().fail("preflight", ErrorClass::EnvironmentFatal));

        let err = h.controller.resume(DEVICE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentFatal);
        assert!(h.store.list_transactions().await.unwrap().is_empty());
        assert!(h.caps.captured(DEVICE).is_empty());

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Preparation);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::EnvironmentFatal);
    }

    #[tokio::test]
    async fn test_orphaned_transaction_is_adopted() {
        let h = harness(ScriptedCapabilities::new());

        // A previous process captured the backup and died mid-step
        let mut orphan = Transaction::open(DEVICE, "sourceRemoval");
        let dir = h.config.backup_root().join(orphan.id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        orphan
            .append_backup(ferry_model::BackupEntry::new(
                "source-management",
                dir.join("01-source-management"),
            ))
            .unwrap();
        h.store.put_transaction(&orphan).await.unwrap();
        let mut record = MigrationRecord::new(DEVICE);
        record.attach_transaction(orphan.id).unwrap();
        h.store.put_record(&record).await.unwrap();

        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::SourceRemoval);
        // Not captured a second time
        assert!(h.caps.captured(DEVICE).is_empty());

        let txs = h.store.list_transactions().await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].id, orphan.id);
        assert_eq!(txs[0].status, TransactionStatus::Committed);
    }

    #[test]
    fn test_call_context_is_bounded() {
        let h = harness(ScriptedCapabilities::new());
        assert_eq!(
            h.controller.context(DEVICE).timeout(),
            Some(h.config.stage_timeout())
        );
    }

    #[tokio::test]
    async fn test_orphan_adopted_past_stale_committed_transaction() {
        let h = harness(ScriptedCapabilities::new());

        // An earlier run committed A but died before detaching it
        let mut committed = Transaction::open(DEVICE, "sourceRemoval");
        committed.mark_committed();
        h.store.put_transaction(&committed).await.unwrap();
        let mut record = MigrationRecord::new(DEVICE);
        record.attach_transaction(committed.id).unwrap();
        h.store.put_record(&record).await.unwrap();

        // The retry persisted B and died before the record named it
        let orphan = Transaction::open(DEVICE, "sourceRemoval");
        h.store.put_transaction(&orphan).await.unwrap();

        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::SourceRemoval);
        assert!(outcome.awaiting_reboot);

        let adopted = h.store.get_transaction(orphan.id).await.unwrap().unwrap();
        assert_eq!(adopted.status, TransactionStatus::Committed);
        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert!(record.transaction_id.is_none());
        assert!(record.last_error.is_none());

        // The device is not left claimed
        h.continuation.simulate_reboot();
        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::TargetEnrollment);
    }

    #[tokio::test]
    async fn test_profile_survives_crash_after_source_removal() {
        let h = harness(
            ScriptedCapabilities::new()
                .with_profile("S-1-5-21-7", "AzureAD\\jdoe")
                .without_source(),
        );

        // Died after removing the source, before the record was updated
        let mut orphan = Transaction::open(DEVICE, "sourceRemoval");
        orphan.profile = Some(ProfileMapping {
            source_sid: "S-1-5-21-7".to_string(),
            target_account: "AzureAD\\jdoe".to_string(),
        });
        h.store.put_transaction(&orphan).await.unwrap();
        let mut record = MigrationRecord::new(DEVICE);
        record.attach_transaction(orphan.id).unwrap();
        h.store.put_record(&record).await.unwrap();

        let outcome = h.controller.resume(DEVICE).await.unwrap();
        assert_eq!(outcome.stage, Stage::SourceRemoval);
        // The device can no longer report it
        assert!(h
            .caps
            .discover_profile(&CapabilityContext::new(DEVICE))
            .await
            .unwrap()
            .is_none());

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.profile.unwrap().target_account, "AzureAD\\jdoe");

        h.continuation.simulate_reboot();
        h.controller.resume(DEVICE).await.unwrap();
        h.continuation.simulate_reboot();
        h.controller.resume(DEVICE).await.unwrap();
        assert!(h.caps.is_profile_transferred(DEVICE));
    }

    #[tokio::test]
    async fn test_discovered_profile_is_kept_in_manifest() {
        let h = harness(ScriptedCapabilities::new().with_profile("S-1-5-21-7", "AzureAD\\jdoe"));
        h.controller.resume(DEVICE).await.unwrap();

        let txs = h.store.list_transactions().await.unwrap();
        assert_eq!(txs[0].profile.as_ref().unwrap().source_sid, "S-1-5-21-7");
    }

    #[tokio::test]
    async fn test_verification_failure_is_report_only() {
        let h = harness(ScriptedCapabilities::new());
        let controller = StageController::new(
            &MigrationConfig {
                required_applications: vec!["Defender".to_string()],
                ..h.config.clone()
            },
            h.store.clone(),
            h.caps.clone(),
            h.continuation.clone(),
        )
        .with_verification_policy(fast_policy());

        controller.resume(DEVICE).await.unwrap();
        h.continuation.simulate_reboot();
        controller.resume(DEVICE).await.unwrap();
        h.continuation.simulate_reboot();
        let outcome = controller.resume(DEVICE).await.unwrap();

        assert_eq!(outcome.stage, Stage::Verification);
        assert!(outcome.verification_failed());
        assert!(h.caps.restored(DEVICE).is_empty());
        let defender = outcome
            .verification
            .as_ref()
            .and_then(|v| v.check("app:Defender").cloned())
            .unwrap();
        assert_eq!(defender.attempts, 3);

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Verification);
        assert_eq!(
            record.last_error.unwrap().kind,
            ErrorKind::VerificationFailure
        );
    }

    #[tokio::test]
    async fn test_skip_verification() {
        let h = harness(ScriptedCapabilities::new());
        let controller = StageController::new(
            &h.config,
            h.store.clone(),
            h.caps.clone(),
            h.continuation.clone(),
        )
        .with_skip_verification(true);

        controller.resume(DEVICE).await.unwrap();
        h.continuation.simulate_reboot();
        controller.resume(DEVICE).await.unwrap();
        h.continuation.simulate_reboot();
        let outcome = controller.resume(DEVICE).await.unwrap();

        assert_eq!(outcome.stage, Stage::Completed);
        assert!(outcome.verification.is_none());
        assert_eq!(h.caps.call_count(DEVICE, "verifyEnrollment"), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_stage() {
        let h = harness(ScriptedCapabilities::new());
        h.controller.resume(DEVICE).await.unwrap();

        h.controller.cancel(DEVICE);
        h.continuation.simulate_reboot();
        let err = h.controller.resume(DEVICE).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled(_)));
        assert_eq!(h.caps.call_count(DEVICE, "prepareTargetEnrollment"), 0);

        let record = h.store.get_record(DEVICE).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::SourceRemoval);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::Cancelled);
    }
}
