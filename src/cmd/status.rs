//! Status command

use crate::cmd::{Engine, EXIT_FAILED, EXIT_OK};
use clap::Args;
use color_eyre::eyre::Result;
use ferry_model::MigrationConfig;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Show one device; all devices when omitted
    #[arg(long)]
    pub device: Option<String>,

    /// Include archived records
    #[arg(long, default_value_t = false)]
    pub archived: bool,
}

/// Print persisted migration records as JSON
pub async fn show_status(args: StatusArgs, config: &MigrationConfig) -> Result<i32> {
    let store = Engine::open_store(config)?;

    let Some(device_id) = args.device else {
        let records = store.list_records().await?;
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(EXIT_OK);
    };

    if args.archived {
        let archived = store.list_archived(&device_id).await?;
        println!("{}", serde_json::to_string_pretty(&archived)?);
        return Ok(EXIT_OK);
    }

    match store.get_record(&device_id).await? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(EXIT_OK)
        }
        None => {
            eprintln!("No migration record for '{}'", device_id);
            Ok(EXIT_FAILED)
        }
    }
}
