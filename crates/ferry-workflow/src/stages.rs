//! Stage work
//!
//! One step per forward transition. Every step backs up what it is about
//! to change, then guards each mutation with a pre-check so re-running it
//! after a crash is harmless.

use crate::error::Result;
use crate::transaction::{Step, TransactionScope};
use async_trait::async_trait;
use ferry_actions::{components, Capabilities};
use ferry_model::{MigrationRecord, ProfileMapping, Stage};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Build the step that advances a record out of `from`
///
/// Returns `None` for stages with no transactional work.
pub fn step_for(
    from: Stage,
    record: &MigrationRecord,
    capabilities: Arc<dyn Capabilities>,
) -> Option<Box<dyn Step>> {
    let step: Box<dyn Step> = match from {
        Stage::Preparation => Box::new(RemoveSource::new(capabilities, record.profile.clone())),
        Stage::SourceRemoval => Box::new(PrepareTarget { capabilities }),
        Stage::IntermediateBoot => Box::new(EnrollTarget { capabilities }),
        Stage::TargetEnrollment => Box::new(TransferProfile {
            capabilities,
            profile: record.profile.clone(),
        }),
        Stage::ProfileCapture => Box::new(Finalize { capabilities }),
        _ => return None,
    };
    Some(step)
}

/// Preparation → SourceRemoval
struct RemoveSource {
    capabilities: Arc<dyn Capabilities>,
    known: Option<ProfileMapping>,
    discovered: Mutex<Option<ProfileMapping>>,
}

impl RemoveSource {
    fn new(capabilities: Arc<dyn Capabilities>, known: Option<ProfileMapping>) -> Self {
        Self {
            capabilities,
            known,
            discovered: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Step for RemoveSource {
    fn stage(&self) -> Stage {
        Stage::SourceRemoval
    }

    async fn execute(&self, scope: &mut TransactionScope<'_>) -> Result<()> {
        // The profile can only be read while the source agent still owns
        // it, so it goes into the manifest before anything is removed
        let mut profile = scope
            .transaction()
            .profile
            .clone()
            .or_else(|| self.known.clone());
        if profile.is_none() {
            profile = self.capabilities.discover_profile(scope.ctx()).await?;
        }
        if let Some(profile) = &profile {
            scope.remember_profile(profile).await?;
        }
        *self.discovered.lock().unwrap() = profile;

        if !self
            .capabilities
            .source_management_present(scope.ctx())
            .await?
        {
            info!(device = %scope.ctx().device_id(), "Source management already absent");
            return Ok(());
        }

        scope.backup(components::SOURCE_MANAGEMENT).await?;
        self.capabilities
            .remove_source_management(scope.ctx())
            .await?;
        Ok(())
    }

    fn apply(&self, record: &mut MigrationRecord) {
        if let Some(profile) = self.discovered.lock().unwrap().take() {
            record.profile = Some(profile);
        }
    }
}

/// SourceRemoval → IntermediateBoot
struct PrepareTarget {
    capabilities: Arc<dyn Capabilities>,
}

#[async_trait]
impl Step for PrepareTarget {
    fn stage(&self) -> Stage {
        Stage::IntermediateBoot
    }

    async fn execute(&self, scope: &mut TransactionScope<'_>) -> Result<()> {
        if self
            .capabilities
            .source_management_present(scope.ctx())
            .await?
        {
            // Came back after the reboot; enrolling on top of it is unsafe
            return Err(ferry_actions::CapabilityError::step_failed(
                "prepareTargetEnrollment",
                "source management is present again after restart",
            )
            .into());
        }

        scope.backup(components::ENROLLMENT_POLICIES).await?;
        self.capabilities
            .prepare_target_enrollment(scope.ctx())
            .await?;
        Ok(())
    }
}

/// IntermediateBoot → TargetEnrollment
struct EnrollTarget {
    capabilities: Arc<dyn Capabilities>,
}

#[async_trait]
impl Step for EnrollTarget {
    fn stage(&self) -> Stage {
        Stage::TargetEnrollment
    }

    async fn execute(&self, scope: &mut TransactionScope<'_>) -> Result<()> {
        let (enrolled, _) = self.capabilities.verify_enrollment(scope.ctx()).await?;
        if enrolled {
            info!(device = %scope.ctx().device_id(), "Already enrolled with target");
            return Ok(());
        }

        scope.backup(components::DIRECTORY_MEMBERSHIP).await?;
        self.capabilities.join_target_directory(scope.ctx()).await?;

        scope.backup(components::MANAGEMENT_ENROLLMENT).await?;
        self.capabilities
            .enroll_target_management(scope.ctx())
            .await?;
        Ok(())
    }
}

/// TargetEnrollment → ProfileCapture
struct TransferProfile {
    capabilities: Arc<dyn Capabilities>,
    profile: Option<ProfileMapping>,
}

#[async_trait]
impl Step for TransferProfile {
    fn stage(&self) -> Stage {
        Stage::ProfileCapture
    }

    async fn execute(&self, scope: &mut TransactionScope<'_>) -> Result<()> {
        let Some(profile) = &self.profile else {
            warn!(
                device = %scope.ctx().device_id(),
                "No primary user profile was discovered, skipping profile transfer"
            );
            return Ok(());
        };

        scope.backup(components::USER_PROFILE).await?;
        self.capabilities
            .transfer_user_profile(scope.ctx(), &profile.source_sid, &profile.target_account)
            .await?;
        Ok(())
    }
}

/// ProfileCapture → Finalize
struct Finalize {
    capabilities: Arc<dyn Capabilities>,
}

#[async_trait]
impl Step for Finalize {
    fn stage(&self) -> Stage {
        Stage::Finalize
    }

    async fn execute(&self, scope: &mut TransactionScope<'_>) -> Result<()> {
        self.capabilities.finalize(scope.ctx()).await?;
        Ok(())
    }
}
