//! Reboot continuation handles
//!
//! A continuation is a single-fire trigger that re-invokes the stage
//! controller after the next boot. The controller persists its resume
//! point before registering one, and consumes it on the first resume in a
//! new boot session so it never replays.

use crate::command::{check_predicate, check_status, render, run_line};
use crate::context::CapabilityContext;
use crate::error::{CapabilityError, Result};
use async_trait::async_trait;
use ferry_model::{ContinuationCommands, Stage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Durable, boot-triggered resumption mechanism
#[async_trait]
pub trait Continuation: Send + Sync {
    /// Identity of the device's current boot session
    async fn boot_id(&self, device_id: &str) -> Result<String>;

    /// Arrange for `resume` to run once after the next boot
    ///
    /// Registering again replaces the existing trigger.
    async fn register(&self, device_id: &str, next: Stage) -> Result<()>;

    /// Remove the trigger; a no-op if none is registered
    async fn consume(&self, device_id: &str) -> Result<()>;

    async fn is_registered(&self, device_id: &str) -> Result<bool>;
}

/// Whether `device_id` names `host`, ignoring case and any domain suffix
pub fn is_same_host(host: &str, device_id: &str) -> bool {
    let short = |name: &str| name.split('.').next().unwrap_or_default().to_ascii_lowercase();
    !host.is_empty() && short(host) == short(device_id)
}

/// One-shot boot task on the local Windows host
///
/// The task runs `<executable> resume --device <id>` as SYSTEM at
/// startup. It is deleted by `consume`, which the controller calls on the
/// first resume in the new boot. Only the host it runs on can be served;
/// any other device id is an environment error.
pub struct ScheduledTaskContinuation {
    executable: PathBuf,
    config_path: Option<PathBuf>,
    local_host: String,
}

impl ScheduledTaskContinuation {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            config_path: None,
            local_host: Self::host_name(),
        }
    }

    /// Name of the host this process runs on
    pub fn host_name() -> String {
        sysinfo::System::host_name().unwrap_or_default()
    }

    /// Treat `host` as the local host name
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    /// Whether a task on this host can resume `device_id`
    pub fn serves(&self, device_id: &str) -> bool {
        is_same_host(&self.local_host, device_id)
    }

    fn ensure_local(&self, device_id: &str) -> Result<()> {
        if self.serves(device_id) {
            return Ok(());
        }
        Err(CapabilityError::EnvironmentFatal(format!(
            "'{}' is not this host ('{}'); remote devices need continuation commands",
            device_id, self.local_host
        )))
    }

    /// Pass `--config <path>` to the resumed process
    pub fn with_config(mut self, config_path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(config_path.into());
        self
    }

    /// Scheduled task name for a device
    pub fn task_name(device_id: &str) -> String {
        format!("Ferry\\Resume-{}", device_id)
    }

    /// Command line the task runs
    pub fn task_command(&self, device_id: &str) -> String {
        let mut line = format!(
            "\"{}\" resume --device \"{}\"",
            self.executable.display(),
            device_id
        );
        if let Some(config) = &self.config_path {
            line.push_str(&format!(" --config \"{}\"", config.display()));
        }
        line
    }

    async fn schtasks(&self, operation: &str, args: &[&str]) -> Result<std::process::Output> {
        debug!(operation = %operation, args = ?args, "Running schtasks");
        Ok(Command::new("schtasks").args(args).output().await?)
    }
}

#[async_trait]
impl Continuation for ScheduledTaskContinuation {
    async fn boot_id(&self, device_id: &str) -> Result<String> {
        self.ensure_local(device_id)?;
        Ok(sysinfo::System::boot_time().to_string())
    }

    async fn register(&self, device_id: &str, next: Stage) -> Result<()> {
        self.ensure_local(device_id)?;
        let name = Self::task_name(device_id);
        let command = self.task_command(device_id);
        let output = self
            .schtasks(
                "register",
                &[
                    "/Create", "/TN", &name, "/TR", &command, "/SC", "ONSTART", "/RU", "SYSTEM",
                    "/RL", "HIGHEST", "/F",
                ],
            )
            .await?;
        check_status("registerContinuation", &output)?;
        info!(device = %device_id, task = %name, next = %next, "Registered boot continuation");
        Ok(())
    }

    async fn consume(&self, device_id: &str) -> Result<()> {
        self.ensure_local(device_id)?;
        if !self.is_registered(device_id).await? {
            return Ok(());
        }
        let name = Self::task_name(device_id);
        let output = self
            .schtasks("consume", &["/Delete", "/TN", &name, "/F"])
            .await?;
        check_status("consumeContinuation", &output)?;
        info!(device = %device_id, task = %name, "Consumed boot continuation");
        Ok(())
    }

    async fn is_registered(&self, device_id: &str) -> Result<bool> {
        self.ensure_local(device_id)?;
        let name = Self::task_name(device_id);
        let output = self.schtasks("query", &["/Query", "/TN", &name]).await?;
        Ok(output.status.success())
    }
}

/// Continuation implemented by operator command templates
///
/// Used when the orchestrator dispatches to devices on other hosts, where
/// the trigger has to be created through a remote-execution tool.
pub struct CommandContinuation {
    commands: ContinuationCommands,
    timeout: Option<Duration>,
}

impl CommandContinuation {
    pub fn new(commands: ContinuationCommands) -> Self {
        Self {
            commands,
            timeout: None,
        }
    }

    /// Bound every continuation command
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn context(&self, device_id: &str) -> CapabilityContext {
        let ctx = CapabilityContext::new(device_id);
        match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }
}

#[async_trait]
impl Continuation for CommandContinuation {
    async fn boot_id(&self, device_id: &str) -> Result<String> {
        let ctx = self.context(device_id);
        let line = render(&self.commands.boot_id, &[("device", device_id)]);
        let output = run_line(&ctx, "bootId", &line).await?;
        check_status("bootId", &output)?;

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(CapabilityError::step_failed("bootId", "command printed nothing"));
        }
        Ok(id)
    }

    async fn register(&self, device_id: &str, next: Stage) -> Result<()> {
        let ctx = self.context(device_id);
        let line = render(
            &self.commands.register,
            &[("device", device_id), ("stage", next.as_str())],
        );
        let output = run_line(&ctx, "registerContinuation", &line).await?;
        check_status("registerContinuation", &output)
    }

    async fn consume(&self, device_id: &str) -> Result<()> {
        let ctx = self.context(device_id);
        let line = render(&self.commands.consume, &[("device", device_id)]);
        let output = run_line(&ctx, "consumeContinuation", &line).await?;
        check_status("consumeContinuation", &output)
    }

    async fn is_registered(&self, device_id: &str) -> Result<bool> {
        let Some(template) = &self.commands.is_registered else {
            return Err(CapabilityError::NotConfigured(
                "continuation.isRegistered".to_string(),
            ));
        };
        let ctx = self.context(device_id);
        let line = render(template, &[("device", device_id)]);
        let output = run_line(&ctx, "continuationRegistered", &line).await?;
        check_predicate("continuationRegistered", &output)
    }
}

/// In-memory continuation with a simulated boot counter
#[derive(Default)]
pub struct SimulatedContinuation {
    boots: AtomicU64,
    registered: Mutex<HashMap<String, Stage>>,
    registrations: AtomicU64,
}

impl SimulatedContinuation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new boot session for every device
    pub fn simulate_reboot(&self) {
        self.boots.fetch_add(1, Ordering::SeqCst);
    }

    /// Stage the registered trigger will resume towards
    pub fn registered_stage(&self, device_id: &str) -> Option<Stage> {
        self.registered.lock().unwrap().get(device_id).copied()
    }

    /// Total number of `register` calls
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Continuation for SimulatedContinuation {
    async fn boot_id(&self, _device_id: &str) -> Result<String> {
        Ok(format!("boot-{}", self.boots.load(Ordering::SeqCst)))
    }

    async fn register(&self, device_id: &str, next: Stage) -> Result<()> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.registered
            .lock()
            .unwrap()
            .insert(device_id.to_string(), next);
        Ok(())
    }

    async fn consume(&self, device_id: &str) -> Result<()> {
        self.registered.lock().unwrap().remove(device_id);
        Ok(())
    }

    async fn is_registered(&self, device_id: &str) -> Result<bool> {
        Ok(self.registered.lock().unwrap().contains_key(device_id))
    }
}
