//! Fleet migration command
//!
//! Reads a device list or schedule file, migrates every device with a
//! bounded worker pool, and writes a JSON report.

use crate::cmd::{Engine, EXIT_FAILED, EXIT_OK};
use chrono::Utc;
use clap::Args;
use color_eyre::eyre::{bail, Result, WrapErr};
use ferry_fleet::{AlwaysAvailable, AvailabilityProbe, CommandProbe, FleetOrchestrator, LocalDriver};
use ferry_model::{FleetReport, MigrationConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Schedule file (one device per line, or CSV) or a comma-separated list
    #[arg(long)]
    pub devices: String,

    /// Maximum devices migrated at once (defaults to maxParallel)
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Complete without post-migration checks
    #[arg(long, default_value_t = false)]
    pub skip_verification: bool,

    /// Migrate devices even if a user is signed in
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Directory to write the fleet report into
    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

pub async fn run_fleet(
    args: RunArgs,
    mut config: MigrationConfig,
    config_path: Option<&Path>,
) -> Result<i32> {
    let devices = parse_devices(&args.devices)?;
    if devices.is_empty() {
        bail!("No devices to migrate in '{}'", args.devices);
    }

    let parallel = args.parallel.unwrap_or(config.max_parallel);
    if parallel < 1 {
        bail!("--parallel must be at least 1");
    }
    if args.skip_verification {
        config.skip_verification = true;
    }

    if let Some(dir) = &args.report_path {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("Failed to create report directory {}", dir.display()))?;
    }

    let probe: Arc<dyn AvailabilityProbe> = match &config.availability {
        Some(commands) => Arc::new(CommandProbe::new(commands.clone())),
        None => Arc::new(AlwaysAvailable),
    };
    let reboot_timeout = config.reboot_timeout();
    let engine = Engine::open(&config, config_path, &devices)?;

    let driver = Arc::new(LocalDriver::new(engine.controller.clone(), reboot_timeout));
    let orchestrator = FleetOrchestrator::new(driver, probe).with_force(args.force);
    let handle = orchestrator.handle();

    let cancel = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, no further devices will be started");
            cancel.cancel();
        }
    });

    let mut progress = handle.progress();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let summary = *progress.borrow_and_update();
            info!(progress = %summary, "Fleet progress");
        }
    });

    let report = orchestrator.run(devices, parallel).await;

    // The devices have been migrated by now; a lost report is not fatal
    if let Some(dir) = &args.report_path {
        match write_report(dir, &report) {
            Ok(path) => info!(path = %path.display(), "Wrote fleet report"),
            Err(e) => {
                error!(error = %e, "Failed to write fleet report");
                eprintln!("Failed to write fleet report: {:#}", e);
            }
        }
    }

    println!("{}", report.summary);
    for job in report.jobs.iter().filter(|j| j.reason.is_some()) {
        println!(
            "  {} {}: {}",
            job.device_id,
            job.status,
            job.reason.as_deref().unwrap_or_default()
        );
    }

    Ok(if report.summary.failed > 0 {
        EXIT_FAILED
    } else {
        EXIT_OK
    })
}

/// Device ids from a schedule file, or from a comma-separated list
pub fn parse_devices(source: &str) -> Result<Vec<String>> {
    let path = Path::new(source);
    if path.is_file() {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read schedule file {}", path.display()))?;
        return Ok(parse_schedule(&content));
    }

    Ok(source
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_schedule(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let first = line.split(',').next()?;
            let device = first.trim().trim_matches('"').trim();
            (!device.is_empty()).then(|| device.to_string())
        })
        .filter(|device| {
            !["devicename", "computername", "device"].contains(&device.to_ascii_lowercase().as_str())
        })
        .collect()
}

fn write_report(dir: &Path, report: &FleetReport) -> Result<PathBuf> {
    let path = dir.join(format!(
        "fleet-report-{}.json",
        Utc::now().format("%Y%m%d-%H%M%S")
    ));
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json)
        .wrap_err_with(|| format!("Failed to write report {}", path.display()))?;
    Ok(path)
}
