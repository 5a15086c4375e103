//! agent-deploy - Entry Point
//!
//! Deploys a containerized agent service to Cloud Run, App Runner or App Platform,
//! or runs it locally with Docker Compose.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{debug, info};

use agent_deployer::app::options::resolve_project_dir;
use agent_deployer::app::state::AppState;
use agent_deployer::commands::{self, clean::CleanArgs, down::DownArgs, local::LocalArgs, plan::PlanArgs, status::StatusArgs, up::UpArgs};
use agent_deployer::errors::DeployError;
use agent_deployer::logs::{init_logging, LogLevel, LogOptions};
use agent_deployer::storage::layout::StorageLayout;
use agent_deployer::storage::settings::Settings;
use agent_deployer::utils::{version_info, LONG_VERSION};

/// Plan, deploy, verify and tear down agent services
#[derive(Parser)]
#[command(name = "agent-deploy")]
#[command(version, long_version = LONG_VERSION, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory containing the Dockerfile (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    project_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "DEPLOY_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// JSON log lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what `up` would change
    Plan(PlanArgs),
    /// Apply the plan and verify the service is healthy
    Up(UpArgs),
    /// Delete the service and its generated secrets
    Down(DownArgs),
    /// Refresh and show the recorded deployment
    Status(StatusArgs),
    /// Build and run the service locally with Docker Compose
    Local(LocalArgs),
    /// Remove local deployment artifacts
    Clean(CleanArgs),
}

impl Commands {
    fn writes_log_files(&self) -> bool {
        !matches!(self, Commands::Clean(_))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let project_dir = resolve_project_dir(cli.project_dir.clone())?;
    let layout = StorageLayout::new(project_dir);
    let settings = Settings::load(&layout.settings_file()).await?;

    let log_dir = if settings.file_logging && cli.command.writes_log_files() {
        layout.setup().await?;
        Some(layout.logs_dir().path().to_path_buf())
    } else {
        None
    };
    let _log_guard = init_logging(LogOptions {
        log_level: cli.log_level.clone().unwrap_or_else(|| settings.log_level.clone()),
        json_format: cli.json_logs || settings.json_logs,
        log_dir,
    })?;
    let version = version_info();
    debug!(version = %version.version, git_hash = %version.git_hash, built = %version.build_time, "agent-deploy starting");
    debug!(project_dir = %layout.project_dir().display(), "Loaded settings: {:?}", settings);

    let app = AppState::new(layout, settings);
    let result = tokio::select! {
        result = run(&app, cli.command) => result,
        _ = await_shutdown_signal() => {
            Err(DeployError::Cancelled("interrupted, state was not modified by the unfinished step".to_string()))
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if e.is_fatal() {
            eprintln!(
                "{}",
                "The state file needs manual attention; it was left untouched.".yellow()
            );
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn run(app: &AppState, command: Commands) -> Result<(), DeployError> {
    match command {
        Commands::Plan(args) => commands::plan::execute(app, args).await,
        Commands::Up(args) => commands::up::execute(app, args).await,
        Commands::Down(args) => commands::down::execute(app, args).await,
        Commands::Status(args) => commands::status::execute(app, args).await,
        Commands::Local(args) => commands::local::execute(app, args).await,
        Commands::Clean(args) => commands::clean::execute(app, args).await,
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received, shutting down..."),
                    _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down..."),
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
