//! Command orchestrator: one module per subcommand

pub mod clean;
pub mod down;
pub mod local;
pub mod plan;
pub mod render;
pub mod status;
pub mod up;

use std::collections::BTreeMap;

use clap::Args;
use secrecy::SecretString;

use crate::app::options::TargetOptions;
use crate::app::state::AppState;
use crate::deploy::Target;
use crate::drivers::Driver;
use crate::errors::DeployError;
use crate::models::{DeploymentState, DesiredService, Environment};
use crate::secrets::{DesiredSecret, GeneratedSecret};
use crate::utils::{git_short_sha, parse_key_value};

/// Environment variable carrying the service API key
pub const API_KEY_ENV: &str = "API_KEY";

/// Service configuration flags shared by `plan`, `up` and `local`
#[derive(Debug, Clone, Default, Args)]
pub struct ServiceArgs {
    /// Container port (defaults to the settings value)
    #[arg(long)]
    pub port: Option<u16>,

    /// Extra environment variable, KEY=VALUE (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub env_vars: Vec<(String, String)>,

    /// Secret exposed as an environment variable, KEY=VALUE (repeatable)
    #[arg(long = "secret", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub secrets: Vec<(String, String)>,

    /// Secret whose value is read from this process's environment (repeatable)
    #[arg(long = "secret-from-env", value_name = "KEY")]
    pub secrets_from_env: Vec<String>,

    /// Generate an API key secret (API_KEY)
    #[arg(long)]
    pub generate_api_key: bool,

    /// Generate an RSA private key secret (RSA_PRIVATE_KEY)
    #[arg(long)]
    pub generate_rsa: bool,
}

impl ServiceArgs {
    pub fn port(&self, app: &AppState) -> u16 {
        self.port.unwrap_or(app.settings.default_port)
    }

    /// Default variables overridden by `--set` pairs
    pub fn env(&self, environment: Environment, port: u16) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("SERVICE_ENVIRONMENT".to_string(), environment.as_str().to_string()),
            ("SERVICE_HOST".to_string(), "0.0.0.0".to_string()),
            ("SERVICE_PORT".to_string(), port.to_string()),
            ("LOG_LEVEL".to_string(), "INFO".to_string()),
        ]);
        env.extend(self.env_vars.iter().cloned());
        env
    }

    /// User secrets plus generated ones. Generated secrets already recorded
    /// for this deployment are reused, not regenerated.
    pub fn secrets(&self, recorded: Option<&DeploymentState>) -> Result<Vec<DesiredSecret>, DeployError> {
        let mut secrets: Vec<DesiredSecret> = self
            .secrets
            .iter()
            .map(|(key, value)| DesiredSecret::user(key.clone(), SecretString::from(value.clone())))
            .collect();

        for key in &self.secrets_from_env {
            let value = std::env::var(key).map_err(|_| {
                DeployError::InvalidInput(format!("environment variable {} is not set", key))
            })?;
            secrets.push(DesiredSecret::user(key.clone(), SecretString::from(value)));
        }

        let kinds = [
            (
                GeneratedSecret::ApiKey,
                self.generate_api_key,
                recorded.is_some_and(|s| s.api_key_generated),
            ),
            (
                GeneratedSecret::RsaKey,
                self.generate_rsa,
                recorded.is_some_and(|s| s.rsa_key_generated),
            ),
        ];
        for (kind, requested, already) in kinds {
            if secrets.iter().any(|s| s.env_key == kind.env_key()) {
                if requested {
                    return Err(DeployError::InvalidInput(format!(
                        "{} is both supplied and generated",
                        kind.env_key()
                    )));
                }
                continue;
            }
            if already {
                secrets.push(DesiredSecret::generated(kind, None));
            } else if requested {
                secrets.push(DesiredSecret::generated(kind, Some(kind.generate()?)));
            }
        }

        secrets.sort_by(|a, b| a.env_key.cmp(&b.env_key));
        Ok(secrets)
    }
}

/// Image selection flags for `plan` and `up`
#[derive(Debug, Clone, Default, Args)]
pub struct ImageArgs {
    /// Deploy this image instead of the project's own
    #[arg(long)]
    pub image: Option<String>,
}

/// Image reference and, when known, its registry digest
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub image: String,
    pub digest: Option<String>,
    /// Built from the project and pushed to the platform registry
    pub managed: bool,
}

/// `{registry-repository}:{git short sha | latest}`
pub async fn project_image(app: &AppState, driver: &dyn Driver, target: &Target) -> Result<String, DeployError> {
    let repository = driver.registry_repository(&target.key).await?;
    let tag = git_short_sha(app.layout.project_dir())
        .await
        .unwrap_or_else(|| "latest".to_string());
    Ok(format!("{}:{}", repository, tag))
}

/// Load the recorded deployment and resolve the target around it.
pub async fn load_target(
    app: &AppState,
    options: &TargetOptions,
) -> Result<(Target, Option<DeploymentState>), DeployError> {
    let key = options.key(app.layout.project_dir())?;
    let recorded = app.store.load(&key).await?;
    let target = options.resolve(key, &app.settings, recorded.as_ref())?;
    Ok((target, recorded))
}

pub fn desired_service(
    app: &AppState,
    target: &Target,
    args: &ServiceArgs,
    image: ResolvedImage,
    secrets: Vec<DesiredSecret>,
    force: bool,
) -> DesiredService {
    let port = args.port(app);
    DesiredService {
        service_name: target.key.service_name.clone(),
        environment: target.key.environment,
        platform: target.key.platform,
        region: target.region.clone(),
        project_id: target.project_id.clone(),
        image: image.image,
        image_digest: image.digest,
        managed_image: image.managed,
        port,
        env: args.env(target.key.environment, port),
        secrets,
        public_url_var: app.settings.public_url_var.clone(),
        force,
    }
}

/// API key value to probe with, when this run knows it
pub fn known_api_key(secrets: &[DesiredSecret]) -> Option<SecretString> {
    secrets
        .iter()
        .find(|s| s.env_key == API_KEY_ENV)
        .and_then(|s| s.value.clone())
}

/// Ask before doing something destructive. `assume_yes` skips the prompt.
pub fn confirm(prompt: &str, assume_yes: bool) -> bool {
    if assume_yes {
        return true;
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}
