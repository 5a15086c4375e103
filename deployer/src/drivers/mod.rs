//! Provider drivers.
//!
//! Every platform implements [`Driver`]. Provider-specific request and response
//! shapes stay behind a per-platform API trait; drivers only exchange the neutral
//! [`ServiceSpec`] and [`ServiceSnapshot`] with it. The diffing rules shared by all
//! platforms live here in [`build_plan`].

pub mod app_platform;
pub mod app_runner;
pub mod cli;
pub mod cloud_run;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::health::clock::Clock;
use crate::models::{
    ActionType, DeploymentPlan, DeploymentResult, DeploymentState, DeploymentStatus,
    DesiredService, Platform, PlannedSecret, ResourceAction, ResourceType, StateKey,
};
use crate::secrets::{Redactor, SecretStore};
use crate::utils::digest_pairs;

use app_platform::AppPlatformDriver;
use app_runner::AppRunnerDriver;
use cloud_run::CloudRunDriver;

/// The common deployment interface
#[async_trait]
pub trait Driver: Send + Sync {
    fn platform(&self) -> Platform;

    /// Problems that must be fixed before anything is mutated. Empty when ready.
    async fn check_prerequisites(&self) -> Vec<String>;

    /// Registry repository images for `key` are pushed to (without tag)
    async fn registry_repository(&self, key: &StateKey) -> Result<String, DeployError>;

    /// Create the registry repository if needed and log docker in to it.
    async fn prepare_registry(&self, key: &StateKey) -> Result<(), DeployError>;

    /// Diff desired against recorded and live state. Read-only.
    async fn plan(
        &self,
        desired: &DesiredService,
        current: Option<&DeploymentState>,
    ) -> Result<DeploymentPlan, DeployError>;

    async fn up(&self, plan: &DeploymentPlan) -> DeploymentResult;

    /// Delete the service and the secrets this tool generated. Absent is success.
    async fn down(&self, state: &DeploymentState) -> DeploymentResult;

    /// Read-only view of the live service
    async fn status(&self, state: &DeploymentState) -> DeploymentResult;

    /// Point the service back at what `previous` recorded.
    async fn rollback(&self, previous: &DeploymentState) -> DeploymentResult;
}

/// Settings every driver needs
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub region: String,
    pub project_id: Option<String>,
    /// Interval between readiness polls
    pub poll_interval: Duration,
    /// Bound on waiting for the provider to report ready
    pub ready_timeout: Duration,
}

impl DriverConfig {
    pub fn new(region: impl Into<String>, project_id: Option<String>) -> Self {
        Self {
            region: region.into(),
            project_id,
            poll_interval: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(300),
        }
    }
}

/// Build the CLI-backed driver for `platform`.
pub fn create_driver(
    platform: Platform,
    config: DriverConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Driver>, DeployError> {
    let driver: Arc<dyn Driver> = match platform {
        Platform::CloudRun => Arc::new(CloudRunDriver::with_cli(config, clock)?),
        Platform::AwsAppRunner => Arc::new(AppRunnerDriver::with_cli(config, clock)),
        Platform::DoAppPlatform => Arc::new(AppPlatformDriver::with_cli(config, clock)),
    };
    Ok(driver)
}

/// Service definition handed to a provider API
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub env: BTreeMap<String, String>,
    /// Env var name -> provider secret reference
    pub secrets: BTreeMap<String, String>,
}

/// Provider-reported lifecycle of a service
#[derive(Debug, Clone, PartialEq)]
pub enum ServicePhase {
    Ready,
    InProgress,
    Failed(String),
}

/// Live view of a service as reported by the provider
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    /// Provider id (name, ARN or app id)
    pub id: String,
    pub name: String,
    pub url: Option<String>,
    pub revision: Option<String>,
    pub image: Option<String>,
    pub image_digest: Option<String>,
    pub phase: ServicePhase,
    /// Plain env as deployed
    pub env: BTreeMap<String, String>,
    pub secret_keys: Vec<String>,
    pub port: Option<u16>,
}

impl ServiceSnapshot {
    pub fn deployment_status(&self) -> DeploymentStatus {
        match self.phase {
            ServicePhase::Ready => DeploymentStatus::Running,
            ServicePhase::InProgress => DeploymentStatus::Updating,
            ServicePhase::Failed(_) => DeploymentStatus::Failed,
        }
    }

    /// Successful result describing this snapshot
    pub fn to_result(&self, fallback_digest: Option<&str>) -> DeploymentResult {
        DeploymentResult {
            success: true,
            service_url: self.url.clone(),
            service_id: Some(self.id.clone()),
            revision: self.revision.clone(),
            image_digest: self
                .image_digest
                .clone()
                .or_else(|| fallback_digest.map(str::to_string)),
            status: self.deployment_status(),
            ..Default::default()
        }
    }

    /// The public URL when the live config does not carry it yet
    pub fn missing_public_url(&self, var: &str) -> Option<String> {
        let url = self.url.as_ref()?;
        if self.env.get(var) == Some(url) {
            None
        } else {
            Some(url.clone())
        }
    }
}

/// Reject specs no provider would accept, before any call is made.
pub fn validate_desired(desired: &DesiredService) -> Result<(), DeployError> {
    let name = desired.provider_service_name();
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if desired.service_name.is_empty()
        || !valid_chars
        || name.starts_with('-')
        || name.ends_with('-')
        || !name.starts_with(|c: char| c.is_ascii_lowercase())
    {
        return Err(DeployError::InvalidInput(format!(
            "service name '{}' must start with a letter and contain only lowercase letters, digits and '-'",
            desired.service_name
        )));
    }
    if name.len() > 40 {
        return Err(DeployError::InvalidInput(format!(
            "service name '{}' is too long (max 40 characters including environment)",
            name
        )));
    }
    if desired.image.trim().is_empty() {
        return Err(DeployError::InvalidInput("image reference is empty".to_string()));
    }
    if desired.port == 0 {
        return Err(DeployError::InvalidInput("port must be non-zero".to_string()));
    }
    if desired.region.trim().is_empty() {
        return Err(DeployError::InvalidInput("region is empty".to_string()));
    }
    for secret in &desired.secrets {
        if desired.env.contains_key(&secret.env_key) {
            return Err(DeployError::InvalidInput(format!(
                "{} is set both as an environment variable and as a secret",
                secret.env_key
            )));
        }
    }
    Ok(())
}

/// Compute the plan from desired input, recorded state and the live service.
///
/// `registry` is the platform's registry action, if it manages one.
pub fn build_plan(
    desired: &DesiredService,
    current: Option<&DeploymentState>,
    live: Option<&ServiceSnapshot>,
    registry: Option<ResourceAction>,
) -> DeploymentPlan {
    let key = desired.key();
    let mut actions = Vec::new();
    if let Some(registry) = registry {
        actions.push(registry);
    }

    let recorded_keys = current.map(DeploymentState::secret_keys).unwrap_or_default();
    let mut secrets = Vec::new();
    for secret in &desired.secrets {
        let name = secret.secret_name(&key);
        let recorded = recorded_keys.contains(&secret.env_key);
        let (action, description) = match (&secret.value, recorded) {
            (None, _) => (ActionType::Noop, format!("Reuse existing secret for {}", secret.env_key)),
            (Some(_), false) => (ActionType::Create, format!("Create secret for {}", secret.env_key)),
            (Some(_), true) if desired.force => (
                ActionType::Update,
                format!("Add a new version of the secret for {}", secret.env_key),
            ),
            (Some(_), true) => (ActionType::Noop, format!("Secret for {} already exists", secret.env_key)),
        };

        let mut resource = ResourceAction::new(ResourceType::Secret, action, &name, description)
            .with_metadata("env_key", secret.env_key.clone());
        if let Some(kind) = secret.generated {
            resource = resource.with_metadata("generated", kind.to_string());
        }
        actions.push(resource);
        secrets.push(PlannedSecret {
            env_key: secret.env_key.clone(),
            secret_name: name,
            action,
            generated: secret.generated,
            value: secret.value.clone(),
        });
    }

    actions.push(diff_service(desired, current, live));

    DeploymentPlan {
        platform: desired.platform,
        service_name: desired.service_name.clone(),
        environment: desired.environment,
        region: desired.region.clone(),
        project_id: desired.project_id.clone(),
        actions,
        estimated_cost: None,
        estimated_duration_secs: None,
        current_image: current.map(|s| s.image_tag.clone()),
        current_url: current
            .and_then(|s| s.service_url.clone())
            .or_else(|| live.and_then(|l| l.url.clone())),
        current_status: current.map(|s| s.status),
        current_service_id: live
            .map(|l| l.id.clone())
            .or_else(|| current.and_then(|s| s.service_id().map(str::to_string))),
        target_image: desired.image.clone(),
        target_digest: desired.image_digest.clone(),
        target_port: desired.port,
        env_vars: desired.env.clone(),
        secrets,
        public_url_var: desired.public_url_var.clone(),
        env_digest: desired.env_digest(),
        secret_keys: desired.secret_keys(),
    }
}

fn diff_service(
    desired: &DesiredService,
    current: Option<&DeploymentState>,
    live: Option<&ServiceSnapshot>,
) -> ResourceAction {
    let name = desired.provider_service_name();
    let service = |action, description: String| {
        ResourceAction::new(ResourceType::Service, action, &name, description)
    };

    let Some(state) = current else {
        return match live {
            None => service(
                ActionType::Create,
                format!("Create service with image {}", desired.image),
            ),
            Some(live) => service(
                ActionType::Update,
                format!(
                    "Adopt existing service {} (no local state) and deploy {}",
                    live.id, desired.image
                ),
            )
            .with_metadata("adopt", true),
        };
    };

    let Some(live) = live else {
        return service(
            ActionType::Create,
            format!(
                "Service missing at provider (recorded {}); recreate with image {}",
                state.image_tag, desired.image
            ),
        )
        .with_metadata("drift", "missing");
    };

    let changes = detect_changes(desired, state, live);
    if changes.is_empty() {
        return if desired.force {
            service(ActionType::Update, "Forced re-apply of unchanged configuration".to_string())
        } else {
            service(ActionType::Noop, "Service is up to date".to_string())
        };
    }
    service(ActionType::Update, changes.join("; "))
}

/// Human-readable reasons the recorded deployment differs from the desired one
fn detect_changes(
    desired: &DesiredService,
    state: &DeploymentState,
    live: &ServiceSnapshot,
) -> Vec<String> {
    let mut changes = Vec::new();

    if let (Some(recorded), Some(observed)) = (&state.image_digest, &live.image_digest) {
        if recorded != observed {
            changes.push(format!(
                "image digest drifted at provider (recorded {}, live {})",
                short_digest(recorded),
                short_digest(observed)
            ));
        }
    }

    match (&desired.image_digest, &state.image_digest) {
        (Some(target), Some(recorded)) => {
            if target != recorded {
                changes.push(format!(
                    "image digest {} -> {}",
                    short_digest(recorded),
                    short_digest(target)
                ));
            }
        }
        _ => {
            if desired.image != state.image_tag {
                changes.push(format!("image {} -> {}", state.image_tag, desired.image));
            }
        }
    }

    if desired.port != state.port {
        changes.push(format!("port {} -> {}", state.port, desired.port));
    }

    match state.env_digest() {
        Some(recorded) if recorded == desired.env_digest() => {}
        Some(_) => changes.push("environment variables changed".to_string()),
        None => changes.push("environment variables not recorded".to_string()),
    }

    let recorded_keys = state.secret_keys();
    let desired_keys = desired.secret_keys();
    if recorded_keys != desired_keys {
        let added: Vec<&str> = desired_keys
            .iter()
            .filter(|k| !recorded_keys.contains(k))
            .map(String::as_str)
            .collect();
        let removed: Vec<&str> = recorded_keys
            .iter()
            .filter(|k| !desired_keys.contains(k))
            .map(String::as_str)
            .collect();
        changes.push(format!(
            "secrets changed (added: [{}], removed: [{}])",
            added.join(", "),
            removed.join(", ")
        ));
    }

    // The live service must still match what the record says was applied.
    if let Some(recorded) = state.env_digest() {
        let live_digest = digest_pairs(
            live.env
                .iter()
                .filter(|(k, _)| **k != desired.public_url_var)
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        if recorded != live_digest {
            changes.push("environment variables drifted at provider".to_string());
        }
    }
    let mut live_keys = live.secret_keys.clone();
    live_keys.sort();
    live_keys.dedup();
    if live_keys != recorded_keys {
        changes.push(format!(
            "secrets drifted at provider (live: [{}])",
            live_keys.join(", ")
        ));
    }

    if state.status == DeploymentStatus::Failed {
        changes.push("last deployment failed".to_string());
    }
    if let ServicePhase::Failed(reason) = &live.phase {
        changes.push(format!("provider reports service failed: {}", reason));
    }

    changes
}

fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    match hex.char_indices().nth(12) {
        Some((end, _)) => &hex[..end],
        None => hex,
    }
}

/// Redactor over every secret value the plan carries
pub fn plan_redactor(plan: &DeploymentPlan) -> Redactor {
    Redactor::new(plan.secrets.iter().filter_map(|s| s.value.as_ref()))
}

/// Upsert changed secrets and resolve references for the rest. Sequential.
pub async fn apply_secrets(
    store: &dyn SecretStore,
    plan: &DeploymentPlan,
) -> Result<BTreeMap<String, String>, DeployError> {
    let mut refs = BTreeMap::new();
    for secret in &plan.secrets {
        let reference = match (&secret.value, secret.action) {
            (Some(value), ActionType::Create | ActionType::Update) => {
                let reference = store.upsert(&secret.secret_name, value).await?;
                info!(secret = %secret.secret_name, "Upserted secret");
                reference
            }
            _ => store.reference(&secret.secret_name).await?,
        };
        refs.insert(secret.env_key.clone(), reference);
    }
    Ok(refs)
}

/// Service definition for `plan`, pre-seeding the public URL when already known.
pub fn service_spec(plan: &DeploymentPlan, secret_refs: BTreeMap<String, String>) -> ServiceSpec {
    let mut env = plan.env_vars.clone();
    if let Some(url) = &plan.current_url {
        env.insert(plan.public_url_var.clone(), url.clone());
    }
    ServiceSpec {
        name: plan.provider_service_name(),
        image: plan.target_image.clone(),
        port: plan.target_port,
        env,
        secrets: secret_refs,
    }
}

/// Full definition `state` was applied with, secret references re-resolved.
/// `None` for records that predate env tracking.
pub async fn recorded_spec(
    store: &dyn SecretStore,
    state: &DeploymentState,
) -> Result<Option<ServiceSpec>, DeployError> {
    let Some(env) = state.env_vars() else {
        return Ok(None);
    };
    let mut secrets = BTreeMap::new();
    for (env_key, name) in state.secret_names() {
        let reference = store.reference(&name).await?;
        secrets.insert(env_key, reference);
    }
    Ok(Some(ServiceSpec {
        name: state.key().provider_service_name(),
        image: state.image_tag.clone(),
        port: state.port,
        env,
        secrets,
    }))
}

/// Poll `fetch` until the service is ready with a URL, failed, or `timeout` passes.
pub async fn wait_until_ready<F, Fut>(
    platform: Platform,
    clock: &dyn Clock,
    poll_interval: Duration,
    timeout: Duration,
    mut fetch: F,
) -> Result<ServiceSnapshot, DeployError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<ServiceSnapshot>, DeployError>>,
{
    let deadline = clock.elapsed() + timeout;
    loop {
        match fetch().await? {
            Some(snapshot) => match &snapshot.phase {
                ServicePhase::Ready if snapshot.url.is_some() => return Ok(snapshot),
                ServicePhase::Failed(reason) => {
                    return Err(DeployError::provider(
                        platform.as_str(),
                        format!("service {} failed: {}", snapshot.name, reason),
                    ));
                }
                _ => debug!(service = %snapshot.name, "Waiting for service to become ready"),
            },
            None => debug!("Service not visible yet"),
        }

        if clock.elapsed() + poll_interval > deadline {
            return Err(DeployError::Timeout(format!(
                "service did not become ready within {}s",
                timeout.as_secs()
            )));
        }
        clock.sleep(poll_interval).await;
    }
}

/// Failure result carrying a redacted message
pub fn failure(redactor: &Redactor, step: &str, err: &DeployError) -> DeploymentResult {
    DeploymentResult::failure(redactor.redact(&err.to_string()))
        .with_detail("step", step)
        .with_detail("recoverable", err.is_recoverable().to_string())
}

/// Values staged for providers that embed secrets in the service definition
pub type StagedSecrets = BTreeMap<String, SecretString>;
