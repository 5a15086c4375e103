//! `up`: build (optionally), plan, confirm, apply and verify

use std::time::Duration;

use clap::Args;
use colored::Colorize;
use tracing::info;

use crate::app::options::TargetOptions;
use crate::app::state::AppState;
use crate::commands::{
    confirm, desired_service, known_api_key, load_target, project_image, render, ImageArgs,
    ResolvedImage, ServiceArgs,
};
use crate::deploy::docker::{build_image, push_image, CLOUD_BUILD_PLATFORM};
use crate::deploy::UpOptions;
use crate::errors::DeployError;

#[derive(Debug, Clone, Args)]
pub struct UpArgs {
    #[command(flatten)]
    pub target: TargetOptions,

    #[command(flatten)]
    pub image: ImageArgs,

    #[command(flatten)]
    pub service: ServiceArgs,

    /// Build and push the project Dockerfile before deploying
    #[arg(long, conflicts_with = "image")]
    pub build: bool,

    /// Re-apply even when nothing changed
    #[arg(long)]
    pub force: bool,

    /// Leave an unhealthy deployment in place instead of rolling back
    #[arg(long)]
    pub no_rollback: bool,

    /// Overall bound on apply plus verification, in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(app: &AppState, args: UpArgs) -> Result<(), DeployError> {
    app.setup().await?;
    let (target, recorded) = load_target(app, &args.target).await?;

    let secrets = args.service.secrets(recorded.as_ref())?;
    let reconciler = app.reconciler(&target, known_api_key(&secrets)).await?;
    let driver = reconciler.driver().clone();

    let image = match &args.image.image {
        Some(image) => ResolvedImage {
            image: image.clone(),
            digest: None,
            managed: false,
        },
        None => {
            let image = project_image(app, driver.as_ref(), &target).await?;
            let digest = if args.build {
                driver.prepare_registry(&target.key).await?;
                build_image(
                    app.layout.project_dir(),
                    app.layout.dockerfile().path(),
                    &image,
                    Some(CLOUD_BUILD_PLATFORM),
                )
                .await?;
                Some(push_image(&image).await?)
            } else {
                None
            };
            ResolvedImage {
                image,
                digest,
                managed: true,
            }
        }
    };

    let desired = desired_service(app, &target, &args.service, image, secrets, args.force);
    let options = UpOptions {
        rollback: !args.no_rollback,
        timeout: args
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| app.settings.deploy_timeout()),
    };

    let (assume_yes, json) = (args.yes, args.json);
    let report = reconciler
        .up(&desired, &options, move |plan| {
            if !json {
                render::print_plan(plan);
            }
            confirm("Apply this plan?", assume_yes)
        })
        .await?;

    if json {
        render::print_json(&report)?;
    } else {
        render::print_up_report(&report);
        if report.succeeded() {
            if let Some(url) = report.state.as_ref().and_then(|s| s.service_url.as_ref()) {
                println!("\n{} {}", "Service URL:".bold(), url.cyan());
            }
        }
    }

    info!(key = %target.key, outcome = ?report.outcome, "Up finished");
    if report.succeeded() {
        Ok(())
    } else {
        Err(DeployError::DeploymentFailed(
            report
                .message
                .clone()
                .unwrap_or_else(|| format!("{:?}", report.outcome)),
        ))
    }
}
