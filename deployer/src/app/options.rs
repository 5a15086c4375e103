//! Command-line options shared by the deployment commands

use std::path::{Path, PathBuf};

use clap::Args;

use crate::deploy::Target;
use crate::errors::DeployError;
use crate::models::{DeploymentState, Environment, Platform, StateKey};
use crate::storage::settings::Settings;
use crate::utils::service_name_from_dir;

/// Which deployment a command acts on
#[derive(Debug, Clone, Args)]
pub struct TargetOptions {
    /// cloud-run, aws-app-runner or do-app-platform
    #[arg(short, long, env = "DEPLOY_PLATFORM")]
    pub platform: Platform,

    /// Service name (defaults to the project directory name)
    #[arg(short, long)]
    pub name: Option<String>,

    /// dev, staging or prod
    #[arg(short, long, default_value = "dev")]
    pub env: Environment,

    #[arg(short, long, env = "DEPLOY_REGION")]
    pub region: Option<String>,

    /// GCP project id (required for cloud-run)
    #[arg(long, env = "DEPLOY_PROJECT_ID")]
    pub project_id: Option<String>,
}

impl TargetOptions {
    pub fn key(&self, project_dir: &Path) -> Result<StateKey, DeployError> {
        let service_name = resolve_service_name(self.name.as_deref(), project_dir)?;
        Ok(StateKey::new(service_name, self.env, self.platform))
    }

    /// Flags win, then the recorded deployment, then settings.
    pub fn resolve(
        &self,
        key: StateKey,
        settings: &Settings,
        recorded: Option<&DeploymentState>,
    ) -> Result<Target, DeployError> {
        let region = self
            .region
            .clone()
            .or_else(|| recorded.map(|s| s.region.clone()))
            .unwrap_or_else(|| settings.region_for(self.platform).to_string());
        let project_id = self
            .project_id
            .clone()
            .or_else(|| recorded.and_then(|s| s.project_id.clone()));
        if self.platform.requires_project() && project_id.is_none() {
            return Err(DeployError::Precondition(format!(
                "{} requires --project-id (or DEPLOY_PROJECT_ID)",
                self.platform
            )));
        }

        Ok(Target {
            key,
            region,
            project_id,
        })
    }
}

pub fn resolve_service_name(name: Option<&str>, project_dir: &Path) -> Result<String, DeployError> {
    match name {
        Some(name) => Ok(name.to_string()),
        None => service_name_from_dir(project_dir).ok_or_else(|| {
            DeployError::InvalidInput(format!(
                "cannot derive a service name from {}, pass --name",
                project_dir.display()
            ))
        }),
    }
}

/// Absolute project directory
pub fn resolve_project_dir(dir: Option<PathBuf>) -> Result<PathBuf, DeployError> {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    if !dir.is_dir() {
        return Err(DeployError::InvalidInput(format!(
            "project directory {} does not exist",
            dir.display()
        )));
    }
    Ok(std::fs::canonicalize(&dir).unwrap_or(dir))
}
