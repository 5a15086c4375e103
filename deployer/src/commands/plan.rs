//! `plan`: show what `up` would change

use clap::Args;
use tracing::info;

use crate::app::options::TargetOptions;
use crate::app::state::AppState;
use crate::commands::{desired_service, load_target, project_image, render, ImageArgs, ResolvedImage, ServiceArgs};
use crate::errors::DeployError;

#[derive(Debug, Clone, Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub target: TargetOptions,

    #[command(flatten)]
    pub image: ImageArgs,

    #[command(flatten)]
    pub service: ServiceArgs,

    /// Re-apply even when nothing changed
    #[arg(long)]
    pub force: bool,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(app: &AppState, args: PlanArgs) -> Result<(), DeployError> {
    let (target, recorded) = load_target(app, &args.target).await?;
    let reconciler = app.reconciler(&target, None).await?;

    let image = match &args.image.image {
        Some(image) => ResolvedImage {
            image: image.clone(),
            digest: None,
            managed: false,
        },
        None => ResolvedImage {
            image: project_image(app, reconciler.driver().as_ref(), &target).await?,
            digest: None,
            managed: true,
        },
    };
    let secrets = args.service.secrets(recorded.as_ref())?;
    let desired = desired_service(app, &target, &args.service, image, secrets, args.force);

    info!(key = %target.key, "Computing plan");
    let plan = reconciler.plan(&desired).await?;
    if args.json {
        render::print_json(&plan)
    } else {
        render::print_plan(&plan);
        Ok(())
    }
}
