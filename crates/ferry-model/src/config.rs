//! Migration configuration
//!
//! A single structured settings object, loaded once and passed to each
//! component constructor.

use crate::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings consumed by the migration engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationConfig {
    /// Directory holding the state database, backups and logs
    pub local_state_path: PathBuf,

    /// Applications that must be present for verification to pass
    pub required_applications: Vec<String>,

    /// Policy markers that must be present for verification to pass
    pub policy_markers: Vec<String>,

    /// Fleet worker pool size
    pub max_parallel: usize,

    /// Days committed backups are kept for manual recovery
    pub rollback_retention_days: u32,

    /// Upper bound on one stage's work
    pub stage_timeout_seconds: u64,

    /// Attempts per stage, including the first (2 = one automatic retry)
    pub max_stage_attempts: u32,

    /// Keep backups after a stage commits
    pub retain_backups: bool,

    /// Complete without running post-migration checks
    pub skip_verification: bool,

    /// How long a fleet driver waits for a device to come back after restart
    pub reboot_timeout_seconds: u64,

    pub verification: VerificationSettings,

    /// Command templates backing the capability interface
    pub commands: CommandTemplates,

    /// Command templates for the continuation handle (remote devices)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationCommands>,

    /// Command templates for fleet availability probes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<AvailabilityCommands>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            local_state_path: default_state_path(),
            required_applications: Vec::new(),
            policy_markers: Vec::new(),
            max_parallel: 5,
            rollback_retention_days: 30,
            stage_timeout_seconds: 1800,
            max_stage_attempts: 2,
            retain_backups: true,
            skip_verification: false,
            reboot_timeout_seconds: 900,
            verification: VerificationSettings::default(),
            commands: CommandTemplates::default(),
            continuation: None,
            availability: None,
        }
    }
}

fn default_state_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\Ferry")
    } else {
        PathBuf::from("/var/lib/ferry")
    }
}

impl MigrationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: MigrationConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.local_state_path.as_os_str().is_empty() {
            return Err(ModelError::MissingField("localStatePath".to_string()));
        }
        if self.max_parallel < 1 {
            return Err(invalid("maxParallel", "must be at least 1"));
        }
        if self.max_stage_attempts < 1 {
            return Err(invalid("maxStageAttempts", "must be at least 1"));
        }
        if self.stage_timeout_seconds == 0 {
            return Err(invalid("stageTimeoutSeconds", "must be greater than 0"));
        }
        if self.verification.attempts < 1 {
            return Err(invalid("verification.attempts", "must be at least 1"));
        }
        if let Some(app) = self.required_applications.iter().find(|a| a.trim().is_empty()) {
            return Err(invalid("requiredApplications", &format!("empty entry {:?}", app)));
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.reboot_timeout_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.rollback_retention_days))
    }

    /// Path of the durable state database
    pub fn store_path(&self) -> PathBuf {
        self.local_state_path.join("ferry.redb")
    }

    /// Root directory for captured backups
    pub fn backup_root(&self) -> PathBuf {
        self.local_state_path.join("backups")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.local_state_path.join("logs")
    }
}

fn invalid(field: &str, message: &str) -> ModelError {
    ModelError::InvalidFieldValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Retry settings for post-migration checks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationSettings {
    /// Evaluations per check, including the first
    pub attempts: u32,

    /// Delay before the second evaluation
    pub delay_seconds: u64,

    pub backoff: Backoff,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_seconds: 10,
            backoff: Backoff::Fixed,
        }
    }
}

/// Delay growth between retries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// External commands implementing each capability
///
/// Templates may reference `{device}`, `{component}`, `{location}`,
/// `{sourceSid}`, `{targetAccount}`, `{application}` and `{marker}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandTemplates {
    pub preflight: Option<String>,
    pub source_management_present: Option<String>,
    pub remove_source_management: Option<String>,
    pub prepare_target_enrollment: Option<String>,
    pub join_target_directory: Option<String>,
    pub enroll_target_management: Option<String>,
    pub discover_profile: Option<String>,
    pub transfer_user_profile: Option<String>,
    pub verify_enrollment: Option<String>,
    pub application_installed: Option<String>,
    pub policy_marker_present: Option<String>,
    pub capture_component: Option<String>,
    pub restore_component: Option<String>,
    pub restart_device: Option<String>,
    pub finalize: Option<String>,
}

/// Command templates for a continuation handle on another host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationCommands {
    /// Register the run-once-after-boot trigger (`{device}`, `{stage}`)
    pub register: String,

    /// Delete the trigger (`{device}`)
    pub consume: String,

    /// Print an identifier of the current boot session (`{device}`)
    pub boot_id: String,

    /// Exit 0 if the trigger exists, 1 otherwise (`{device}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_registered: Option<String>,
}

/// Command templates for fleet availability probes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityCommands {
    /// Exit 0 if the device is reachable (`{device}`)
    pub reachable: String,

    /// Exit 0 if the device is actively in use (`{device}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_use: Option<String>,
}
