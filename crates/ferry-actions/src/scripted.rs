//! Scripted capability implementation for tests
//!
//! `ScriptedCapabilities` keeps a small in-memory model of each device
//! (agent present, joined, enrolled, ...) and records every call made
//! against it. Failures can be injected per operation, optionally for a
//! single device or a limited number of calls.

use crate::context::CapabilityContext;
use crate::error::{CapabilityError, ErrorClass, Result};
use crate::traits::{components, Capabilities};
use async_trait::async_trait;
use ferry_model::ProfileMapping;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct DeviceState {
    source_present: bool,
    joined: bool,
    enrolled: bool,
    profile: Option<ProfileMapping>,
    profile_transferred: bool,
    installed: HashSet<String>,
    markers: HashSet<String>,
    calls: Vec<String>,
    captured: Vec<String>,
    restored: Vec<String>,
    restarts: u32,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            source_present: true,
            joined: false,
            enrolled: false,
            profile: None,
            profile_transferred: false,
            installed: HashSet::new(),
            markers: HashSet::new(),
            calls: Vec::new(),
            captured: Vec::new(),
            restored: Vec::new(),
            restarts: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct ScriptedFailure {
    device: Option<String>,
    operation: String,
    class: ErrorClass,
    /// `None` fails forever
    remaining: Option<u32>,
}

/// In-memory capability double
pub struct ScriptedCapabilities {
    initial: DeviceState,
    devices: Mutex<HashMap<String, DeviceState>>,
    failures: Mutex<Vec<ScriptedFailure>>,
    failing_restores: HashSet<String>,
    delay: Option<Duration>,
    restart_hook: Option<RestartHook>,
}

type RestartHook = Box<dyn Fn(&str) + Send + Sync>;

impl Default for ScriptedCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCapabilities {
    /// Devices start with the source agent present and nothing else
    pub fn new() -> Self {
        Self {
            initial: DeviceState::default(),
            devices: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
            failing_restores: HashSet::new(),
            delay: None,
            restart_hook: None,
        }
    }

    /// Every device has a primary profile moving to `target_account`
    pub fn with_profile(mut self, source_sid: &str, target_account: &str) -> Self {
        self.initial.profile = Some(ProfileMapping {
            source_sid: source_sid.to_string(),
            target_account: target_account.to_string(),
        });
        self
    }

    pub fn with_installed_app(mut self, application: &str) -> Self {
        self.initial.installed.insert(application.to_string());
        self
    }

    pub fn with_policy_marker(mut self, marker: &str) -> Self {
        self.initial.markers.insert(marker.to_string());
        self
    }

    /// Devices start without the source agent
    pub fn without_source(mut self) -> Self {
        self.initial.source_present = false;
        self
    }

    /// Sleep this long inside every mutating call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Run `hook` with the device id whenever a restart is requested
    pub fn on_restart(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.restart_hook = Some(Box::new(hook));
        self
    }

    /// Make `operation` fail on every call
    pub fn fail(self, operation: &str, class: ErrorClass) -> Self {
        self.push_failure(None, operation, class, None)
    }

    /// Make `operation` fail on the next `times` calls
    pub fn fail_times(self, operation: &str, times: u32, class: ErrorClass) -> Self {
        self.push_failure(None, operation, class, Some(times))
    }

    /// Make `operation` fail on every call for one device
    pub fn fail_for_device(self, device_id: &str, operation: &str, class: ErrorClass) -> Self {
        self.push_failure(Some(device_id.to_string()), operation, class, None)
    }

    /// Make restoring `component` fail
    pub fn fail_restore(mut self, component: &str) -> Self {
        self.failing_restores.insert(component.to_string());
        self
    }

    fn push_failure(
        mut self,
        device: Option<String>,
        operation: &str,
        class: ErrorClass,
        remaining: Option<u32>,
    ) -> Self {
        self.failures.get_mut().unwrap().push(ScriptedFailure {
            device,
            operation: operation.to_string(),
            class,
            remaining,
        });
        self
    }

    /// Operations called for a device, in order
    pub fn calls(&self, device_id: &str) -> Vec<String> {
        self.read(device_id, |s| s.calls.clone())
    }

    pub fn call_count(&self, device_id: &str, operation: &str) -> usize {
        self.read(device_id, |s| s.calls.iter().filter(|c| *c == operation).count())
    }

    /// Components captured for a device, in order
    pub fn captured(&self, device_id: &str) -> Vec<String> {
        self.read(device_id, |s| s.captured.clone())
    }

    /// Components whose restoration was attempted, in order
    pub fn restored(&self, device_id: &str) -> Vec<String> {
        self.read(device_id, |s| s.restored.clone())
    }

    pub fn restarts(&self, device_id: &str) -> u32 {
        self.read(device_id, |s| s.restarts)
    }

    pub fn is_enrolled(&self, device_id: &str) -> bool {
        self.read(device_id, |s| s.enrolled)
    }

    pub fn is_source_present(&self, device_id: &str) -> bool {
        self.read(device_id, |s| s.source_present)
    }

    pub fn is_profile_transferred(&self, device_id: &str) -> bool {
        self.read(device_id, |s| s.profile_transferred)
    }

    fn read<T>(&self, device_id: &str, f: impl FnOnce(&DeviceState) -> T) -> T {
        let devices = self.devices.lock().unwrap();
        match devices.get(device_id) {
            Some(state) => f(state),
            None => f(&self.initial),
        }
    }

    /// Record the call, then apply any scripted failure, then mutate state
    async fn call<T>(
        &self,
        ctx: &CapabilityContext,
        operation: &str,
        mutating: bool,
        f: impl FnOnce(&mut DeviceState) -> Result<T>,
    ) -> Result<T> {
        self.with_state(ctx.device_id(), |state| state.calls.push(operation.to_string()));

        if mutating {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }

        self.scripted_failure(ctx.device_id(), operation)?;
        self.with_state(ctx.device_id(), f)
    }

    fn with_state<T>(&self, device_id: &str, f: impl FnOnce(&mut DeviceState) -> T) -> T {
        let mut devices = self.devices.lock().unwrap();
        let state = devices
            .entry(device_id.to_string())
            .or_insert_with(|| self.initial.clone());
        f(state)
    }

    fn scripted_failure(&self, device_id: &str, operation: &str) -> Result<()> {
        let mut failures = self.failures.lock().unwrap();
        for failure in failures.iter_mut() {
            if failure.operation != operation {
                continue;
            }
            if failure.device.as_deref().is_some_and(|d| d != device_id) {
                continue;
            }
            match failure.remaining {
                Some(0) => continue,
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            return Err(CapabilityError::of_class(
                failure.class,
                operation,
                "scripted failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Capabilities for ScriptedCapabilities {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn preflight(&self, ctx: &CapabilityContext) -> Result<()> {
        self.call(ctx, "preflight", false, |_| Ok(())).await
    }

    async fn source_management_present(&self, ctx: &CapabilityContext) -> Result<bool> {
        self.call(ctx, "sourceManagementPresent", false, |s| Ok(s.source_present))
            .await
    }

    async fn remove_source_management(&self, ctx: &CapabilityContext) -> Result<()> {
        self.call(ctx, "removeSourceManagement", true, |s| {
            s.source_present = false;
            Ok(())
        })
        .await
    }

    async fn prepare_target_enrollment(&self, ctx: &CapabilityContext) -> Result<()> {
        self.call(ctx, "prepareTargetEnrollment", true, |_| Ok(()))
            .await
    }

    async fn join_target_directory(&self, ctx: &CapabilityContext) -> Result<()> {
        self.call(ctx, "joinTargetDirectory", true, |s| {
            s.joined = true;
            Ok(())
        })
        .await
    }

    async fn enroll_target_management(&self, ctx: &CapabilityContext) -> Result<()> {
        self.call(ctx, "enrollTargetManagement", true, |s| {
            s.enrolled = true;
            Ok(())
        })
        .await
    }

    async fn discover_profile(&self, ctx: &CapabilityContext) -> Result<Option<ProfileMapping>> {
        // Owned by the source agent; gone once it is removed
        self.call(ctx, "discoverProfile", false, |s| {
            Ok(s.profile.clone().filter(|_| s.source_present))
        })
            .await
    }

    async fn transfer_user_profile(
        &self,
        ctx: &CapabilityContext,
        source_sid: &str,
        target_account: &str,
    ) -> Result<()> {
        self.call(ctx, "transferUserProfile", true, |s| {
            let expected = s.profile.as_ref().map(|p| (p.source_sid.as_str(), p.target_account.as_str()));
            if expected != Some((source_sid, target_account)) {
                return Err(CapabilityError::step_failed(
                    "transferUserProfile",
                    format!("no profile {} for {}", source_sid, target_account),
                ));
            }
            s.profile_transferred = true;
            Ok(())
        })
        .await
    }

    async fn verify_enrollment(&self, ctx: &CapabilityContext) -> Result<(bool, String)> {
        self.call(ctx, "verifyEnrollment", false, |s| {
            let detail = if s.enrolled { "enrolled" } else { "not enrolled" };
            Ok((s.enrolled, detail.to_string()))
        })
        .await
    }

    async fn application_installed(
        &self,
        ctx: &CapabilityContext,
        application: &str,
    ) -> Result<bool> {
        self.call(ctx, "applicationInstalled", false, |s| {
            Ok(s.installed.contains(application))
        })
        .await
    }

    async fn policy_marker_present(&self, ctx: &CapabilityContext, marker: &str) -> Result<bool> {
        self.call(ctx, "policyMarkerPresent", false, |s| Ok(s.markers.contains(marker)))
            .await
    }

    async fn capture_component(
        &self,
        ctx: &CapabilityContext,
        component: &str,
        location: &Path,
    ) -> Result<()> {
        self.call(ctx, "captureComponent", false, |_| Ok(())).await?;
        tokio::fs::write(location, component.as_bytes()).await?;
        self.with_state(ctx.device_id(), |s| s.captured.push(component.to_string()));
        Ok(())
    }

    async fn restore_component(
        &self,
        ctx: &CapabilityContext,
        component: &str,
        location: &Path,
    ) -> Result<()> {
        let _ = location;
        let failing = self.failing_restores.contains(component);
        self.call(ctx, "restoreComponent", false, |s| {
            s.restored.push(component.to_string());
            if failing {
                return Err(CapabilityError::step_failed(
                    "restoreComponent",
                    format!("cannot restore {}", component),
                ));
            }
            match component {
                components::SOURCE_MANAGEMENT => s.source_present = true,
                components::DIRECTORY_MEMBERSHIP => s.joined = false,
                components::MANAGEMENT_ENROLLMENT => s.enrolled = false,
                components::USER_PROFILE => s.profile_transferred = false,
                _ => {}
            }
            Ok(())
        })
        .await
    }

    async fn restart_device(&self, ctx: &CapabilityContext) -> Result<()> {
        self.call(ctx, "restartDevice", false, |s| {
            s.restarts += 1;
            Ok(())
        })
        .await?;
        if let Some(hook) = &self.restart_hook {
            hook(ctx.device_id());
        }
        Ok(())
    }

    async fn finalize(&self, ctx: &CapabilityContext) -> Result<()> {
        self.call(ctx, "finalize", true, |_| Ok(())).await
    }
}
