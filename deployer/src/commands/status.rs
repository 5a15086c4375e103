//! `status`: refresh and show the recorded deployment

use clap::Args;

use crate::app::options::TargetOptions;
use crate::app::state::AppState;
use crate::commands::{load_target, render};
use crate::errors::DeployError;

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub target: TargetOptions,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(app: &AppState, args: StatusArgs) -> Result<(), DeployError> {
    let (target, recorded) = load_target(app, &args.target).await?;
    if recorded.is_none() {
        return Err(DeployError::Precondition(format!(
            "no deployment recorded for {}, run `up` first",
            target.key
        )));
    }

    let reconciler = app.reconciler(&target, None).await?;
    let report = reconciler.status(&target.key).await?;
    if args.json {
        render::print_json(&report)
    } else {
        render::print_status_report(&report);
        Ok(())
    }
}
