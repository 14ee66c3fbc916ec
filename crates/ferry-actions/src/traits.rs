//! Capability interface
//!
//! The migration engine never mutates a device directly. Everything it does
//! to the endpoint (agent removal, directory join, enrollment, profile
//! hand-over) goes through the `Capabilities` trait, which is injected at
//! construction time.

use crate::context::CapabilityContext;
use crate::error::Result;
use async_trait::async_trait;
use ferry_model::ProfileMapping;
use std::path::Path;
use std::sync::Arc;

/// Logical component names used for backups
pub mod components {
    /// Source management agent, its services and enrollment registration
    pub const SOURCE_MANAGEMENT: &str = "source-management";
    /// Enrollment policies the target management service relies on
    pub const ENROLLMENT_POLICIES: &str = "enrollment-policies";
    /// Directory membership before the target join
    pub const DIRECTORY_MEMBERSHIP: &str = "directory-membership";
    /// Management enrollment state before the target enrollment
    pub const MANAGEMENT_ENROLLMENT: &str = "management-enrollment";
    /// User profile ownership before the hand-over
    pub const USER_PROFILE: &str = "user-profile";
}

/// Operations the migration engine performs against a device
///
/// Mutating operations should be safe to repeat: the stage controller may
/// re-run a stage after a crash, guarded by the matching predicate
/// (`source_management_present`, `verify_enrollment`).
#[async_trait]
pub trait Capabilities: Send + Sync {
    /// Name of the implementation (for logs)
    fn name(&self) -> &str;

    /// Check privileges and platform support before any work begins
    ///
    /// Errors here are classified `EnvironmentFatal`.
    async fn preflight(&self, ctx: &CapabilityContext) -> Result<()>;

    /// Whether the source management agent is still present
    async fn source_management_present(&self, ctx: &CapabilityContext) -> Result<bool>;

    async fn remove_source_management(&self, ctx: &CapabilityContext) -> Result<()>;

    async fn prepare_target_enrollment(&self, ctx: &CapabilityContext) -> Result<()>;

    async fn join_target_directory(&self, ctx: &CapabilityContext) -> Result<()>;

    async fn enroll_target_management(&self, ctx: &CapabilityContext) -> Result<()>;

    /// Find the primary user profile and the account it moves to
    async fn discover_profile(&self, ctx: &CapabilityContext) -> Result<Option<ProfileMapping>>;

    async fn transfer_user_profile(
        &self,
        ctx: &CapabilityContext,
        source_sid: &str,
        target_account: &str,
    ) -> Result<()>;

    /// Whether the device is enrolled with the target, with a detail string
    async fn verify_enrollment(&self, ctx: &CapabilityContext) -> Result<(bool, String)>;

    async fn application_installed(&self, ctx: &CapabilityContext, application: &str)
        -> Result<bool>;

    async fn policy_marker_present(&self, ctx: &CapabilityContext, marker: &str) -> Result<bool>;

    /// Capture a component's state to `location`
    async fn capture_component(
        &self,
        ctx: &CapabilityContext,
        component: &str,
        location: &Path,
    ) -> Result<()>;

    /// Restore a component from what `capture_component` wrote
    async fn restore_component(
        &self,
        ctx: &CapabilityContext,
        component: &str,
        location: &Path,
    ) -> Result<()>;

    /// Ask the OS to restart
    async fn restart_device(&self, ctx: &CapabilityContext) -> Result<()>;

    /// Final clean-up once the target owns the device
    async fn finalize(&self, ctx: &CapabilityContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Captures and restores rollback data for a transaction
#[async_trait]
pub trait BackupHandler: Send + Sync {
    async fn capture(&self, ctx: &CapabilityContext, component: &str, location: &Path) -> Result<()>;

    async fn restore(&self, ctx: &CapabilityContext, component: &str, location: &Path) -> Result<()>;
}

/// Backs up through a device's capability implementation
pub struct CapabilityBackups {
    capabilities: Arc<dyn Capabilities>,
}

impl CapabilityBackups {
    pub fn new(capabilities: Arc<dyn Capabilities>) -> Self {
        Self { capabilities }
    }
}

#[async_trait]
impl BackupHandler for CapabilityBackups {
    async fn capture(&self, ctx: &CapabilityContext, component: &str, location: &Path) -> Result<()> {
        self.capabilities
            .capture_component(ctx, component, location)
            .await
    }

    async fn restore(&self, ctx: &CapabilityContext, component: &str, location: &Path) -> Result<()> {
        self.capabilities
            .restore_component(ctx, component, location)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedCapabilities;

    #[tokio::test]
    async fn test_capability_backups_delegate() {
        let scripted = Arc::new(ScriptedCapabilities::new());
        let backups = CapabilityBackups::new(scripted.clone());
        let dir = tempfile::tempdir().unwrap();
        let ctx = CapabilityContext::new("LAPTOP-042");

        let location = dir.path().join("01-source-management");
        backups
            .capture(&ctx, components::SOURCE_MANAGEMENT, &location)
            .await
            .unwrap();
        backups
            .restore(&ctx, components::SOURCE_MANAGEMENT, &location)
            .await
            .unwrap();

        assert_eq!(scripted.captured("LAPTOP-042"), vec!["source-management"]);
        assert_eq!(scripted.restored("LAPTOP-042"), vec!["source-management"]);
    }
}
