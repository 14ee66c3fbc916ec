//! Subcommands of the `migrate` binary

pub mod cleanup;
pub mod resume;
pub mod run;
pub mod status;

use color_eyre::eyre::{bail, Result, WrapErr};
use ferry_actions::{
    is_same_host, Capabilities, CommandCapabilities, CommandContinuation, Continuation,
    ScheduledTaskContinuation,
};
use ferry_model::MigrationConfig;
use ferry_workflow::{RedbStateStore, StageController, StateStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// No device failed
pub const EXIT_OK: i32 = 0;
/// At least one device failed
pub const EXIT_FAILED: i32 = 1;
/// Configuration or environment error; no work was attempted
pub const EXIT_FATAL: i32 = 2;

/// Load the configuration file, or defaults when none is given
pub fn load_config(path: Option<&Path>) -> Result<MigrationConfig> {
    match path {
        Some(path) => MigrationConfig::load(path)
            .wrap_err_with(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let config = MigrationConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Without continuation commands only this host can be resumed after a
/// restart, so any other device is refused before work starts
fn ensure_reachable_continuation(config: &MigrationConfig, devices: &[String]) -> Result<()> {
    if config.continuation.is_some() {
        return Ok(());
    }
    let host = ScheduledTaskContinuation::host_name();
    let remote: Vec<&str> = devices
        .iter()
        .map(String::as_str)
        .filter(|device| !is_same_host(&host, device))
        .collect();
    if !remote.is_empty() {
        bail!(
            "No continuation commands configured, so only this host ('{}') can be migrated; remote devices: {}",
            host,
            remote.join(", ")
        );
    }
    Ok(())
}

/// Everything a command needs to drive devices
pub struct Engine {
    pub controller: Arc<StageController>,
}

impl Engine {
    /// Open the state store and wire the configured adapters for `devices`
    ///
    /// Fails before touching any device or the store if the capability
    /// commands are incomplete or the devices cannot be resumed.
    pub fn open(
        config: &MigrationConfig,
        config_path: Option<&Path>,
        devices: &[String],
    ) -> Result<Self> {
        let commands = CommandCapabilities::new(config.commands.clone());
        let missing = commands.missing_templates();
        if !missing.is_empty() {
            bail!("No command configured for: {}", missing.join(", "));
        }
        ensure_reachable_continuation(config, devices)?;
        let capabilities: Arc<dyn Capabilities> = Arc::new(commands);

        let continuation = Self::open_continuation(config, config_path)?;
        let store = Self::open_store(config)?;

        let controller = StageController::new(config, store, capabilities, continuation);
        Ok(Self {
            controller: Arc::new(controller),
        })
    }

    /// The configured continuation, or a local scheduled task
    pub fn open_continuation(
        config: &MigrationConfig,
        config_path: Option<&Path>,
    ) -> Result<Arc<dyn Continuation>> {
        if let Some(commands) = &config.continuation {
            return Ok(Arc::new(
                CommandContinuation::new(commands.clone()).with_timeout(config.stage_timeout()),
            ));
        }

        let exe = std::env::current_exe().wrap_err("Cannot determine the path of this executable")?;
        let mut task = ScheduledTaskContinuation::new(exe);
        if let Some(path) = config_path {
            task = task.with_config(absolute(path));
        }
        Ok(Arc::new(task))
    }

    /// Open only the state store, for commands that do not touch devices
    pub fn open_store(config: &MigrationConfig) -> Result<Arc<dyn StateStore>> {
        let path = config.store_path();
        let store = RedbStateStore::open(&path)
            .wrap_err_with(|| format!("Failed to open state store at {}", path.display()))?;
        Ok(Arc::new(store))
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
