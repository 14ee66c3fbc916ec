//! Resume command
//!
//! Entry point of the boot-time continuation on the device itself. Runs
//! stages until the next reboot boundary, then asks for the restart that
//! brings this command back.

use crate::cmd::{Engine, EXIT_FAILED, EXIT_FATAL, EXIT_OK};
use clap::Args;
use color_eyre::eyre::Result;
use ferry_model::{ErrorKind, MigrationConfig};
use std::path::Path;
use tracing::{error, info, warn};

#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Device whose migration to continue
    #[arg(long)]
    pub device: String,
}

pub async fn resume_device(
    args: ResumeArgs,
    config: &MigrationConfig,
    config_path: Option<&Path>,
) -> Result<i32> {
    let engine = Engine::open(config, config_path, std::slice::from_ref(&args.device))?;
    let device_id = args.device.as_str();

    let outcome = match engine.controller.resume(device_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(device = %device_id, error = %e, "Migration stopped");
            eprintln!("{}: {}", device_id, e);
            return Ok(match e.kind() {
                ErrorKind::EnvironmentFatal => EXIT_FATAL,
                _ => EXIT_FAILED,
            });
        }
    };

    if outcome.awaiting_reboot {
        info!(device = %device_id, stage = %outcome.stage, "Restarting to continue migration");
        println!("{}: {} (restarting)", device_id, outcome.stage);
        let ctx = engine.controller.context(device_id);
        engine.controller.capabilities().restart_device(&ctx).await?;
        return Ok(EXIT_OK);
    }

    println!("{}: {}", device_id, outcome.stage);
    if outcome.verification_failed() {
        if let Some(verification) = &outcome.verification {
            warn!(device = %device_id, failures = %verification.failure_summary(), "Verification failed");
            println!("  verification failed: {}", verification.failure_summary());
        }
        return Ok(EXIT_FAILED);
    }
    if outcome.stage.is_failure() {
        return Ok(EXIT_FAILED);
    }
    Ok(EXIT_OK)
}
