// Migration engine entry point
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use ferry_model::MigrationConfig;
use std::io::stderr;
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod cmd;

use cmd::cleanup::CleanupArgs;
use cmd::resume::ResumeArgs;
use cmd::run::RunArgs;
use cmd::status::StatusArgs;

#[derive(Parser, Debug)]
#[command(
    name = "migrate",
    author,
    version,
    about = "Staged Workspace ONE to Intune device migration",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Migrate a fleet of devices with bounded parallelism
    Run(RunArgs),
    /// Continue one device's migration (run by the boot-time trigger)
    Resume(ResumeArgs),
    /// Show persisted migration records
    Status(StatusArgs),
    /// Archive finished records and prune expired backups
    Cleanup(CleanupArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match cmd::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(cmd::EXIT_FATAL);
        }
    };

    let guard = match init_logging(&config, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Environment error: {:#}", e);
            std::process::exit(cmd::EXIT_FATAL);
        }
    };
    debug!(state = %config.local_state_path.display(), "Logger initialized");

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run(args) => cmd::run::run_fleet(args, config, config_path).await,
        Commands::Resume(args) => cmd::resume::resume_device(args, &config, config_path).await,
        Commands::Status(args) => cmd::status::show_status(args, &config).await,
        Commands::Cleanup(args) => cmd::cleanup::cleanup(args, &config, config_path).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            cmd::EXIT_FATAL
        }
    };

    // Flush the file writer before exiting
    drop(guard);
    std::process::exit(code);
}

/// Log to stderr and to a daily file under the state directory
///
/// The boot-time `resume` has no console, so the file is the only record
/// of what it did.
fn init_logging(config: &MigrationConfig, verbose: bool) -> Result<WorkerGuard> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .wrap_err_with(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "migrate.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let level = if verbose { "debug" } else { "info" };
    let default_directives = format!(
        "migrate={level},ferry_actions={level},ferry_workflow={level},ferry_fleet={level},redb=warn",
        level = level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    registry()
        .with(filter)
        .with(fmt::layer().with_writer(stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}
