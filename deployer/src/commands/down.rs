//! `down`: tear down the service and the secrets this tool generated

use clap::Args;

use crate::app::options::TargetOptions;
use crate::app::state::AppState;
use crate::commands::{confirm, load_target, render};
use crate::errors::DeployError;

#[derive(Debug, Clone, Args)]
pub struct DownArgs {
    #[command(flatten)]
    pub target: TargetOptions,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(app: &AppState, args: DownArgs) -> Result<(), DeployError> {
    let (target, _) = load_target(app, &args.target).await?;
    let prompt = format!("Delete {} and its generated secrets?", target.key);
    if !confirm(&prompt, args.yes) {
        println!("Aborted");
        return Ok(());
    }

    let reconciler = app.reconciler(&target, None).await?;
    let report = reconciler.down(&target).await?;
    if args.json {
        render::print_json(&report)?;
    } else {
        render::print_down_report(&report);
    }

    if report.result.success {
        Ok(())
    } else {
        Err(DeployError::DeploymentFailed(report.result.message().to_string()))
    }
}
