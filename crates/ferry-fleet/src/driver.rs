//! Per-device dispatch
//!
//! A driver takes one device from wherever its record stands to a terminal
//! stage, or to a failed verification, across as many restarts as needed.

use crate::error::{FleetError, Result};
use async_trait::async_trait;
use ferry_workflow::{ResumeOutcome, StageController};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Drives a single device's migration
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn drive(&self, device_id: &str) -> Result<ResumeOutcome>;

    /// Stop the device before its next stage
    fn cancel(&self, device_id: &str);
}

/// Runs the stage controller in this process and restarts the device at
/// every reboot boundary
pub struct LocalDriver {
    controller: Arc<StageController>,
    reboot_timeout: Duration,
    poll_interval: Duration,
}

impl LocalDriver {
    pub fn new(controller: Arc<StageController>, reboot_timeout: Duration) -> Self {
        Self {
            controller,
            reboot_timeout,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// How often to check whether a restarted device is back
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn controller(&self) -> &Arc<StageController> {
        &self.controller
    }

    async fn restart_and_wait(&self, device_id: &str) -> Result<()> {
        let continuation = self.controller.continuation();
        let before = continuation.boot_id(device_id).await?;

        info!(device = %device_id, "Restarting device");
        let ctx = self.controller.context(device_id);
        self.controller.capabilities().restart_device(&ctx).await?;

        let wait = async {
            loop {
                match continuation.boot_id(device_id).await {
                    Ok(current) if current != before => return,
                    Ok(_) => {}
                    // Expected while the device is down
                    Err(e) => debug!(device = %device_id, error = %e, "Boot id unavailable"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(self.reboot_timeout, wait)
            .await
            .map_err(|_| FleetError::RebootTimeout {
                device_id: device_id.to_string(),
                timeout: self.reboot_timeout,
            })?;
        info!(device = %device_id, "Device is back after restart");
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for LocalDriver {
    async fn drive(&self, device_id: &str) -> Result<ResumeOutcome> {
        loop {
            let outcome = self.controller.resume(device_id).await?;
            if !outcome.awaiting_reboot {
                if outcome.verification_failed() {
                    warn!(device = %device_id, "Stopped at failed verification");
                }
                return Ok(outcome);
            }
            self.restart_and_wait(device_id).await?;
        }
    }

    fn cancel(&self, device_id: &str) {
        self.controller.cancel(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_actions::{ScriptedCapabilities, SimulatedContinuation};
    use ferry_model::{MigrationConfig, Stage};
    use ferry_workflow::{MemoryStateStore, StateStore};

    fn driver(
        dir: &tempfile::TempDir,
        caps: ScriptedCapabilities,
        continuation: Arc<SimulatedContinuation>,
    ) -> (LocalDriver, Arc<ScriptedCapabilities>) {
        let config = MigrationConfig {
            local_state_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let caps = Arc::new(caps);
        let controller = Arc::new(StageController::new(
            &config,
            store,
            caps.clone(),
            continuation,
        ));
        let driver = LocalDriver::new(controller, Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(5));
        (driver, caps)
    }

    #[tokio::test]
    async fn test_drives_through_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let continuation = Arc::new(SimulatedContinuation::new());
        let rebooter = continuation.clone();
        let caps = ScriptedCapabilities::new().on_restart(move |_| rebooter.simulate_reboot());
        let (driver, caps) = driver(&dir, caps, continuation);

        let outcome = driver.drive("LAPTOP-042").await.unwrap();
        assert_eq!(outcome.stage, Stage::Completed);
        assert_eq!(caps.restarts("LAPTOP-042"), 2);
    }

    #[tokio::test]
    async fn test_reboot_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let continuation = Arc::new(SimulatedContinuation::new());
        // Restart requests are accepted but the device never comes back
        let (driver, _caps) = driver(&dir, ScriptedCapabilities::new(), continuation);

        let err = driver.drive("LAPTOP-042").await.unwrap_err();
        assert!(matches!(err, FleetError::RebootTimeout { .. }));
    }
}
