//! `local`: build and run the service with Docker Compose, then verify it

use std::collections::BTreeMap;
use std::path::Path;

use clap::Args;
use colored::Colorize;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::app::options::resolve_service_name;
use crate::app::state::AppState;
use crate::commands::{known_api_key, render, ServiceArgs};
use crate::deploy::compose::{compose_logs, compose_up, ComposeFile, LOG_TAIL_LINES};
use crate::deploy::docker::{build_image, docker_available};
use crate::errors::DeployError;
use crate::models::Environment;

#[derive(Debug, Clone, Args)]
pub struct LocalArgs {
    /// Service name (defaults to the project directory name)
    #[arg(short, long)]
    pub name: Option<String>,

    #[arg(short, long, default_value = "dev")]
    pub env: Environment,

    #[command(flatten)]
    pub service: ServiceArgs,

    /// Only write the compose file
    #[arg(long)]
    pub docker_files_only: bool,

    /// Reuse the existing local image
    #[arg(long)]
    pub no_build: bool,
}

pub async fn execute(app: &AppState, args: LocalArgs) -> Result<(), DeployError> {
    app.setup().await?;
    let name = resolve_service_name(args.name.as_deref(), app.layout.project_dir())?;
    let container = format!("{}-{}", name, args.env);
    let image = format!("{}:local", container);
    let port = args.service.port(app);

    let secrets = args.service.secrets(None)?;
    let values: BTreeMap<String, SecretString> = secrets
        .iter()
        .filter_map(|s| s.value.clone().map(|v| (s.env_key.clone(), v)))
        .collect();

    let compose = ComposeFile::single(
        &container,
        &image,
        port,
        &args.service.env(args.env, port),
        secrets.iter().map(|s| s.env_key.clone()),
    );
    let compose_file = app.layout.compose_file();
    compose.write(&compose_file).await?;
    println!("{} {}", "Wrote".green(), compose_file.path().display());
    if args.docker_files_only {
        return Ok(());
    }

    if !docker_available().await {
        return Err(DeployError::Precondition(
            "Docker is not running or not installed".to_string(),
        ));
    }
    if !args.no_build {
        build_image(app.layout.project_dir(), app.layout.dockerfile().path(), &image, None).await?;
    }
    compose_up(compose_file.path(), &values).await?;

    let url = format!("http://localhost:{}", port);
    info!(url = %url, "Local service started");
    let report = app.verifier(known_api_key(&secrets))?.verify(&url).await;
    render::print_health(&report);

    println!("\n{:<12} {}", "Service:", container.bold());
    println!("{:<12} {}", "Image:", image);
    println!("{:<12} {}", "URL:", url.cyan());
    if !values.is_empty() {
        println!(
            "{:<12} {}",
            "Secrets:",
            values.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    }

    if report.passed() {
        Ok(())
    } else {
        show_service_logs(compose_file.path()).await;
        Err(DeployError::DeploymentFailed(format!(
            "local service is unhealthy: {}",
            report.diagnostics()
        )))
    }
}

async fn show_service_logs(compose_file: &Path) {
    println!("\n{}", "Service logs:".bold());
    match compose_logs(compose_file, LOG_TAIL_LINES).await {
        Ok(logs) if logs.is_empty() => println!("  {}", "no output".dimmed()),
        Ok(logs) => println!("{}", logs),
        Err(e) => warn!("Could not read service logs: {}", e),
    }
}
