//! Error types for the migration workflow
//!
//! `WorkflowError::kind` maps every error onto the classification that is
//! persisted as a record's `lastError` and decides retry or rollback.

use crate::store::StoreError;
use ferry_actions::{CapabilityError, ErrorClass};
use ferry_model::{ErrorKind, ModelError, Stage};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Error type for migration workflow operations
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A capability call failed
    #[error("capability call failed: {0}")]
    Capability(#[from] CapabilityError),

    /// The device failed its pre-work environment check
    #[error("preflight failed: {0}")]
    Preflight(#[source] CapabilityError),

    /// State store error
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Model invariant violated
    #[error(transparent)]
    Model(#[from] ModelError),

    /// A second transaction was requested while one is open
    #[error("device '{device_id}' already has an open transaction{}", display_tx(transaction_id))]
    TransactionAlreadyOpen {
        device_id: String,
        transaction_id: Option<Uuid>,
    },

    /// Operation on a transaction in the wrong lifecycle state
    #[error("transaction {id} is {status}, expected {expected}")]
    InvalidTransactionState {
        id: Uuid,
        status: String,
        expected: String,
    },

    /// Restoring backups failed
    #[error(
        "rollback of transaction {transaction_id} could not restore {}; escalate to manual recovery (cause: {cause})",
        failures.join(", ")
    )]
    RollbackFailed {
        transaction_id: Uuid,
        failures: Vec<String>,
        cause: String,
    },

    /// A stage's work ran past its deadline
    #[error("stage {stage} timed out after {timeout:?}")]
    StageTimeout { stage: Stage, timeout: Duration },

    /// Migration record not found
    #[error("no migration record for device '{0}'")]
    NotFound(String),

    /// The operator cancelled the device's migration
    #[error("migration of '{0}' cancelled")]
    Cancelled(String),

    /// I/O error while managing backups
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_tx(id: &Option<Uuid>) -> String {
    id.map(|id| format!(" ({})", id)).unwrap_or_default()
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

impl WorkflowError {
    /// Classification persisted with the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Capability(e) => e.class().into(),
            WorkflowError::Preflight(e) => match e.class() {
                ErrorClass::Transient => ErrorKind::Transient,
                _ => ErrorKind::EnvironmentFatal,
            },
            WorkflowError::StageTimeout { .. } => ErrorKind::Transient,
            WorkflowError::RollbackFailed { .. } => ErrorKind::RollbackFailure,
            WorkflowError::Cancelled(_) => ErrorKind::Cancelled,
            WorkflowError::Store(_)
            | WorkflowError::Model(_)
            | WorkflowError::TransactionAlreadyOpen { .. }
            | WorkflowError::InvalidTransactionState { .. }
            | WorkflowError::NotFound(_)
            | WorkflowError::Io(_) => ErrorKind::StepFailure,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Backups that could not be restored, if this is a rollback failure
    pub fn restore_failures(&self) -> &[String] {
        match self {
            WorkflowError::RollbackFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}
