//! Migration record types
//!
//! One `MigrationRecord` exists per device-run. It is the only state that
//! survives a reboot, so every field needed to continue after a restart
//! lives here.

use crate::{ModelError, Result, Stage, SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Durable per-device migration progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    /// Schema version of the persisted form
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Stable device identifier (immutable)
    pub device_id: String,

    /// Last stage whose work completed, or a terminal failure state
    pub stage: Stage,

    /// When the record was created
    pub started_at: DateTime<Utc>,

    /// When the record was last persisted
    pub updated_at: DateTime<Utc>,

    /// Transaction currently open for this device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,

    /// Attempts made at the current stage's work
    #[serde(default)]
    pub attempts: u32,

    /// Most recent error, cleared when a stage completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<MigrationError>,

    /// Set while suspended at a reboot boundary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_reboot: Option<RebootMarker>,

    /// User profile discovered before the source management was removed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileMapping>,

    /// Stage transitions in the order they happened
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<StageTransition>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl MigrationRecord {
    /// Create a record at `Preparation`
    pub fn new(device_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            device_id: device_id.into(),
            stage: Stage::Preparation,
            started_at: now,
            updated_at: now,
            transaction_id: None,
            attempts: 0,
            last_error: None,
            awaiting_reboot: None,
            profile: None,
            history: Vec::new(),
        }
    }

    /// Validate the record
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(ModelError::MissingField("deviceId".to_string()));
        }
        if self.stage.is_terminal() && self.transaction_id.is_some() {
            return Err(ModelError::InvalidFieldValue {
                field: "transactionId".to_string(),
                message: format!("terminal stage {} cannot hold an open transaction", self.stage),
            });
        }
        Ok(())
    }

    /// Move forward to `to`, resetting the per-stage attempt counter
    pub fn advance_to(&mut self, to: Stage) -> Result<()> {
        self.stage.check_transition(to)?;
        self.history.push(StageTransition {
            from: self.stage,
            to,
            at: Utc::now(),
        });
        self.stage = to;
        self.attempts = 0;
        self.last_error = None;
        self.touch();
        Ok(())
    }

    /// Move to a terminal failure state, recording why
    pub fn fail(&mut self, to: Stage, error: MigrationError) -> Result<()> {
        if !to.is_failure() {
            return Err(ModelError::InvalidStageTransition {
                from: self.stage,
                to,
            });
        }
        self.stage.check_transition(to)?;
        self.history.push(StageTransition {
            from: self.stage,
            to,
            at: Utc::now(),
        });
        self.stage = to;
        self.transaction_id = None;
        self.awaiting_reboot = None;
        self.last_error = Some(error);
        self.touch();
        Ok(())
    }

    /// Attach an open transaction; only one may be attached at a time
    pub fn attach_transaction(&mut self, id: Uuid) -> Result<()> {
        match self.transaction_id {
            Some(existing) if existing != id => Err(ModelError::InvalidFieldValue {
                field: "transactionId".to_string(),
                message: format!("transaction {} is already open", existing),
            }),
            _ => {
                self.transaction_id = Some(id);
                self.touch();
                Ok(())
            }
        }
    }

    /// Detach the open transaction
    pub fn detach_transaction(&mut self) {
        self.transaction_id = None;
        self.touch();
    }

    /// Record an error without changing stage
    pub fn record_error(&mut self, error: MigrationError) {
        self.last_error = Some(error);
        self.touch();
    }

    /// Whether the record is suspended waiting for a restart
    pub fn is_awaiting_reboot(&self) -> bool {
        self.awaiting_reboot.is_some()
    }

    /// Update the modification timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One entry in a record's stage history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
}

/// Boot session in which a record was suspended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebootMarker {
    /// Identity of the boot session that must end before work continues
    pub boot_id: String,

    /// When the suspension began
    pub since: DateTime<Utc>,
}

/// Source profile and the account it is handed to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileMapping {
    pub source_sid: String,
    pub target_account: String,
}

/// Classification of a recorded error
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Eligible for automatic retry within the stage's attempt budget
    Transient,
    /// Aborted before any transactional work began
    EnvironmentFatal,
    /// A capability call failed mid-stage and was rolled back
    StepFailure,
    /// Restoration itself failed; manual recovery required
    RollbackFailure,
    /// Work succeeded but post-conditions are unmet
    VerificationFailure,
    /// Stopped by the operator
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::EnvironmentFatal => "environmentFatal",
            ErrorKind::StepFailure => "stepFailure",
            ErrorKind::RollbackFailure => "rollbackFailure",
            ErrorKind::VerificationFailure => "verificationFailure",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether an operator has to step in before anything else happens
    pub fn requires_manual_recovery(&self) -> bool {
        matches!(self, ErrorKind::RollbackFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error persisted as `lastError`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationError {
    pub kind: ErrorKind,

    /// Stage the failing work was advancing from
    pub stage: Stage,

    pub message: String,

    /// Itemized detail (e.g. backups that could not be restored)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,

    pub at: DateTime<Utc>,
}

impl MigrationError {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            details: Vec::new(),
            at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.kind, self.stage, self.message)?;
        if !self.details.is_empty() {
            write!(f, " ({})", self.details.join("; "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record() {
        let record = MigrationRecord::new("LAPTOP-042");
        assert_eq!(record.stage, Stage::Preparation);
        assert_eq!(record.attempts, 0);
        assert!(record.transaction_id.is_none());
        assert!(record.validate().is_ok());
        assert!(MigrationRecord::new("  ").validate().is_err());
    }

    #[test]
    fn test_advance_resets_attempts_and_error() {
        let mut record = MigrationRecord::new("LAPTOP-042");
        record.attempts = 2;
        record.record_error(MigrationError::new(
            ErrorKind::Transient,
            Stage::Preparation,
            "throttled",
        ));

        record.advance_to(Stage::SourceRemoval).unwrap();
        assert_eq!(record.stage, Stage::SourceRemoval);
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].from, Stage::Preparation);

        assert!(record.advance_to(Stage::Preparation).is_err());
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut record = MigrationRecord::new("LAPTOP-042");
        record.attach_transaction(Uuid::new_v4()).unwrap();

        let error = MigrationError::new(ErrorKind::StepFailure, Stage::Preparation, "agent busy");
        record.fail(Stage::RolledBack, error).unwrap();
        assert_eq!(record.stage, Stage::RolledBack);
        assert!(record.transaction_id.is_none());
        assert!(record.validate().is_ok());

        let again = MigrationError::new(ErrorKind::StepFailure, Stage::RolledBack, "again");
        assert!(record.fail(Stage::Failed, again).is_err());
        assert!(record.advance_to(Stage::SourceRemoval).is_err());
    }

    #[test]
    fn test_single_open_transaction() {
        let mut record = MigrationRecord::new("LAPTOP-042");
        let first = Uuid::new_v4();
        record.attach_transaction(first).unwrap();
        // Re-attaching the same transaction is allowed (adoption after a crash)
        record.attach_transaction(first).unwrap();
        assert!(record.attach_transaction(Uuid::new_v4()).is_err());

        record.detach_transaction();
        assert!(record.attach_transaction(Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_error_display() {
        let error = MigrationError::new(
            ErrorKind::RollbackFailure,
            Stage::IntermediateBoot,
            "restore failed",
        )
        .with_details(vec!["management-enrollment".to_string()]);
        assert_eq!(
            error.to_string(),
            "rollbackFailure at intermediateBoot: restore failed (management-enrollment)"
        );
        assert!(error.kind.requires_manual_recovery());
    }

    #[test]
    fn test_record_serialization() {
        let mut record = MigrationRecord::new("LAPTOP-042");
        record.profile = Some(ProfileMapping {
            source_sid: "S-1-5-21-1".to_string(),
            target_account: "AzureAD\\jdoe".to_string(),
        });
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"deviceId\":\"LAPTOP-042\""));
        assert!(json.contains("\"stage\":\"preparation\""));
        assert!(!json.contains("transactionId"));

        let parsed: MigrationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
