//! Cleanup command
//!
//! Archives finished records, removes leftover boot triggers and deletes
//! backups whose retention window has passed.

use crate::cmd::{Engine, EXIT_FAILED, EXIT_OK};
use chrono::Utc;
use clap::Args;
use color_eyre::eyre::Result;
use ferry_actions::{CapabilityBackups, CommandCapabilities};
use ferry_model::MigrationConfig;
use ferry_workflow::TransactionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Archive this device's record
    #[arg(long)]
    pub device: Option<String>,

    /// Archive even if the migration has not finished
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Also delete the device's retained backups now
    #[arg(long, default_value_t = false)]
    pub purge_backups: bool,
}

pub async fn cleanup(
    args: CleanupArgs,
    config: &MigrationConfig,
    config_path: Option<&Path>,
) -> Result<i32> {
    let store = Engine::open_store(config)?;
    let backups = CapabilityBackups::new(Arc::new(CommandCapabilities::new(config.commands.clone())));
    let transactions = TransactionManager::new(store.clone(), Arc::new(backups), config.backup_root())
        .with_retention(config.retention());

    if let Some(device_id) = &args.device {
        let Some(record) = store.get_record(device_id).await? else {
            eprintln!("No migration record for '{}'", device_id);
            return Ok(EXIT_FAILED);
        };
        if !record.stage.is_terminal() && !args.force {
            eprintln!(
                "'{}' is at {}; pass --force to archive an unfinished migration",
                device_id, record.stage
            );
            return Ok(EXIT_FAILED);
        }

        let continuation = Engine::open_continuation(config, config_path)?;
        if let Err(e) = continuation.consume(device_id).await {
            warn!(device = %device_id, error = %e, "Failed to remove boot trigger");
        }

        store.archive_record(device_id).await?;
        info!(device = %device_id, stage = %record.stage, "Archived migration record");
        println!("Archived {} ({})", device_id, record.stage);

        if args.purge_backups {
            let purged = transactions.purge_device(device_id).await?;
            println!("Deleted {} backup set(s) for {}", purged, device_id);
        }
    }

    let pruned = transactions.prune_expired(Utc::now()).await?;
    println!("Pruned {} expired backup set(s)", pruned);
    Ok(EXIT_OK)
}
