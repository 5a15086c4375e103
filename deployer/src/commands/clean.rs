//! `clean`: remove local deployment artifacts

use clap::Args;
use colored::Colorize;
use tracing::{info, warn};

use crate::app::state::AppState;
use crate::commands::confirm;
use crate::deploy::compose::compose_down;
use crate::deploy::docker::docker_available;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::utils::format_size;

#[derive(Debug, Clone, Args)]
pub struct CleanArgs {
    /// Only delete deployment state records
    #[arg(long, conflicts_with = "docker_only")]
    pub state_only: bool,

    /// Only delete generated Docker files
    #[arg(long)]
    pub docker_only: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub force: bool,
}

/// What a `clean` run would remove
#[derive(Debug, Clone, PartialEq)]
pub enum CleanScope {
    State,
    DockerFiles,
    Everything,
}

impl CleanArgs {
    pub fn scope(&self) -> CleanScope {
        if self.state_only {
            CleanScope::State
        } else if self.docker_only {
            CleanScope::DockerFiles
        } else {
            CleanScope::Everything
        }
    }
}

pub async fn execute(app: &AppState, args: CleanArgs) -> Result<(), DeployError> {
    let scope = args.scope();
    let (count, bytes) = usage(app, &scope).await?;
    if count == 0 {
        println!("Nothing to clean");
        return Ok(());
    }

    let prompt = format!("Delete {} file(s) ({})?", count, format_size(bytes));
    if !confirm(&prompt, args.force) {
        println!("Aborted");
        return Ok(());
    }

    if scope != CleanScope::State {
        stop_local(app).await;
    }

    match scope {
        CleanScope::State => {
            let _guard = app.store.lock().await;
            for file in app.store.list_files().await? {
                file.delete().await?;
            }
        }
        CleanScope::DockerFiles => {
            app.layout.compose_file().delete().await?;
        }
        CleanScope::Everything => {
            let _guard = app.store.lock().await;
            app.layout.deployment_dir().delete().await?;
        }
    }

    info!(?scope, files = count, "Cleaned deployment artifacts");
    println!(
        "{}",
        format!("✓ Removed {} file(s) ({})", count, format_size(bytes)).green()
    );
    Ok(())
}

/// Stop the `local` compose app before its file goes away. Best effort.
async fn stop_local(app: &AppState) {
    let compose_file = app.layout.compose_file();
    if !compose_file.exists().await || !docker_available().await {
        return;
    }
    if let Err(e) = compose_down(compose_file.path()).await {
        warn!("Could not stop the local service: {}", e);
    }
}

async fn usage(app: &AppState, scope: &CleanScope) -> Result<(usize, u64), DeployError> {
    match scope {
        CleanScope::State => files_usage(&app.store.list_files().await?).await,
        CleanScope::DockerFiles => files_usage(&[app.layout.compose_file()]).await,
        CleanScope::Everything => app.layout.deployment_dir().usage().await,
    }
}

async fn files_usage(files: &[File]) -> Result<(usize, u64), DeployError> {
    let mut count = 0;
    let mut bytes = 0;
    for file in files {
        if file.exists().await {
            count += 1;
            bytes += file.size().await?;
        }
    }
    Ok((count, bytes))
}
