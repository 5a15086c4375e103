//! GCP Cloud Run driver, backed by `gcloud`

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{info, warn};

use crate::drivers::cli::{args, is_not_found, CliRunner};
use crate::drivers::{
    apply_secrets, build_plan, failure, plan_redactor, recorded_spec, service_spec,
    validate_desired, wait_until_ready, Driver, DriverConfig, ServicePhase, ServiceSnapshot,
    ServiceSpec,
};
use crate::errors::DeployError;
use crate::health::clock::Clock;
use crate::models::{
    ActionType, DeploymentPlan, DeploymentResult, DeploymentState, DeploymentStatus,
    DesiredService, Platform, StateKey,
};
use crate::secrets::{owned_secret_names, Redactor, SecretStore};

const PLATFORM: Platform = Platform::CloudRun;

/// Cloud Run operations the driver needs
#[async_trait]
pub trait CloudRunApi: Send + Sync {
    async fn check_access(&self) -> Vec<String>;
    async fn describe_service(&self, name: &str) -> Result<Option<ServiceSnapshot>, DeployError>;
    /// Create or update; routes all traffic to the new revision.
    async fn deploy_service(&self, spec: &ServiceSpec) -> Result<(), DeployError>;
    /// Redeploy another image, keeping the rest of the configuration
    async fn set_image(&self, name: &str, image: &str) -> Result<(), DeployError>;
    async fn route_traffic(&self, name: &str, revision: &str) -> Result<(), DeployError>;
    async fn delete_service(&self, name: &str) -> Result<bool, DeployError>;
    /// Artifact Registry repository path for `key`
    fn repository(&self, key: &StateKey) -> String;
    async fn ensure_repository(&self, key: &StateKey) -> Result<(), DeployError>;
}

pub struct CloudRunDriver {
    config: DriverConfig,
    api: Arc<dyn CloudRunApi>,
    secrets: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
}

impl CloudRunDriver {
    pub fn new(
        config: DriverConfig,
        api: Arc<dyn CloudRunApi>,
        secrets: Arc<dyn SecretStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            api,
            secrets,
            clock,
        }
    }

    /// Driver talking to GCP through the `gcloud` CLI
    pub fn with_cli(config: DriverConfig, clock: Arc<dyn Clock>) -> Result<Self, DeployError> {
        let project = config
            .project_id
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                DeployError::Precondition(
                    "Cloud Run requires a project id (--project-id or DEPLOY_PROJECT_ID)".to_string(),
                )
            })?;
        let gcloud = Gcloud::new(project, config.region.clone());
        let api = Arc::new(GcloudCloudRun(gcloud.clone()));
        let secrets = Arc::new(SecretManagerStore(gcloud));
        Ok(Self::new(config, api, secrets, clock))
    }

    async fn wait_ready(&self, name: &str) -> Result<ServiceSnapshot, DeployError> {
        wait_until_ready(
            PLATFORM,
            self.clock.as_ref(),
            self.config.poll_interval,
            self.config.ready_timeout,
            || self.api.describe_service(name),
        )
        .await
    }

    async fn apply(&self, plan: &DeploymentPlan) -> Result<DeploymentResult, (&'static str, DeployError)> {
        let name = plan.provider_service_name();

        if plan.registry_action().map(|a| a.action) == Some(ActionType::Create) {
            self.api
                .ensure_repository(&plan.key())
                .await
                .map_err(|e| ("registry", e))?;
        }

        let refs = apply_secrets(self.secrets.as_ref(), plan)
            .await
            .map_err(|e| ("secrets", e))?;

        let mut spec = service_spec(plan, refs);
        info!(service = %name, image = %spec.image, "Deploying Cloud Run service");
        self.api.deploy_service(&spec).await.map_err(|e| ("deploy", e))?;
        let mut snapshot = self.wait_ready(&name).await.map_err(|e| ("wait", e))?;

        if let Some(url) = snapshot.missing_public_url(&plan.public_url_var) {
            info!(service = %name, url = %url, "Injecting public URL");
            spec.env.insert(plan.public_url_var.clone(), url);
            self.api.deploy_service(&spec).await.map_err(|e| ("public_url", e))?;
            snapshot = self.wait_ready(&name).await.map_err(|e| ("wait", e))?;
        }

        Ok(snapshot.to_result(plan.target_digest.as_deref()))
    }
}

#[async_trait]
impl Driver for CloudRunDriver {
    fn platform(&self) -> Platform {
        PLATFORM
    }

    async fn check_prerequisites(&self) -> Vec<String> {
        self.api.check_access().await
    }

    async fn registry_repository(&self, key: &StateKey) -> Result<String, DeployError> {
        Ok(self.api.repository(key))
    }

    async fn prepare_registry(&self, key: &StateKey) -> Result<(), DeployError> {
        self.api.ensure_repository(key).await
    }

    async fn plan(
        &self,
        desired: &DesiredService,
        current: Option<&DeploymentState>,
    ) -> Result<DeploymentPlan, DeployError> {
        validate_desired(desired)?;
        let live = self
            .api
            .describe_service(&desired.provider_service_name())
            .await?;
        Ok(build_plan(desired, current, live.as_ref(), None))
    }

    async fn up(&self, plan: &DeploymentPlan) -> DeploymentResult {
        let started = self.clock.elapsed();
        let redactor = plan_redactor(plan);
        let result = match self.apply(plan).await {
            Ok(result) => result,
            Err((step, err)) => failure(&redactor, step, &err),
        };
        result.with_elapsed(self.clock.elapsed().saturating_sub(started))
    }

    async fn down(&self, state: &DeploymentState) -> DeploymentResult {
        let key = state.key();
        let name = key.provider_service_name();
        let redactor = Redactor::default();

        match self.api.delete_service(&name).await {
            Ok(true) => info!(service = %name, "Deleted Cloud Run service"),
            Ok(false) => info!(service = %name, "Cloud Run service already absent"),
            Err(e) => return failure(&redactor, "delete_service", &e),
        }

        for secret in owned_secret_names(&key, state.api_key_generated, state.rsa_key_generated) {
            if let Err(e) = self.secrets.delete(&secret).await {
                return failure(&redactor, "delete_secret", &e).with_detail("secret", secret);
            }
        }

        DeploymentResult::success(DeploymentStatus::Deleted)
    }

    async fn status(&self, state: &DeploymentState) -> DeploymentResult {
        match self.api.describe_service(&state.key().provider_service_name()).await {
            Ok(Some(snapshot)) => snapshot.to_result(None),
            Ok(None) => DeploymentResult {
                status: DeploymentStatus::Deleted,
                ..DeploymentResult::failure("service not found at provider")
            },
            Err(e) => failure(&Redactor::default(), "describe", &e),
        }
    }

    async fn rollback(&self, previous: &DeploymentState) -> DeploymentResult {
        let name = previous.key().provider_service_name();
        let redactor = Redactor::default();

        let routed = match &previous.revision {
            Some(revision) => match self.api.route_traffic(&name, revision).await {
                Ok(()) => {
                    info!(service = %name, revision = %revision, "Routed traffic to previous revision");
                    true
                }
                Err(e) => {
                    warn!(service = %name, "Traffic rollback failed, redeploying previous image: {}", e);
                    false
                }
            },
            None => false,
        };

        if !routed {
            let applied = match recorded_spec(self.secrets.as_ref(), previous).await {
                Ok(Some(spec)) => {
                    info!(service = %name, image = %spec.image, "Re-deploying previous configuration");
                    self.api.deploy_service(&spec).await
                }
                Ok(None) => self.api.set_image(&name, &previous.image_tag).await,
                Err(e) => Err(e),
            };
            if let Err(e) = applied {
                return failure(&redactor, "rollback", &e);
            }
        }

        match self.wait_ready(&name).await {
            Ok(snapshot) => {
                let mut result = snapshot.to_result(previous.image_digest.as_deref());
                result.status = DeploymentStatus::RolledBack;
                result
            }
            Err(e) => failure(&redactor, "rollback_wait", &e),
        }
    }
}

/// `gcloud` bound to one project and region
#[derive(Debug, Clone)]
struct Gcloud {
    cli: CliRunner,
    project: String,
    region: String,
}

impl Gcloud {
    fn new(project: String, region: String) -> Self {
        Self {
            cli: CliRunner::new("gcloud", PLATFORM),
            project,
            region,
        }
    }

    fn argv(&self, items: &[&str], regional: bool) -> Vec<String> {
        let mut argv: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        argv.push(format!("--project={}", self.project));
        if regional {
            argv.push(format!("--region={}", self.region));
        }
        argv.push("--quiet".to_string());
        argv
    }

    fn registry_host(&self) -> String {
        format!("{}-docker.pkg.dev", self.region)
    }
}

struct GcloudCloudRun(Gcloud);

#[async_trait]
impl CloudRunApi for GcloudCloudRun {
    async fn check_access(&self) -> Vec<String> {
        let cli = &self.0.cli;
        let mut errors = Vec::new();

        if !cli.probe(&args(["version"])).await {
            errors.push("gcloud CLI not found or not working".to_string());
            return errors;
        }

        let account = cli
            .run(
                &args(["auth", "list", "--filter=status:ACTIVE", "--format=value(account)"]),
                None,
            )
            .await;
        if !matches!(&account, Ok(out) if !out.trim().is_empty()) {
            errors.push("No active gcloud authentication found (run `gcloud auth login`)".to_string());
        }

        match cli
            .run(
                &self.0.argv(&["services", "list", "--enabled", "--format=value(config.name)"], false),
                None,
            )
            .await
        {
            Ok(enabled) => {
                for api in [
                    "run.googleapis.com",
                    "secretmanager.googleapis.com",
                    "artifactregistry.googleapis.com",
                ] {
                    if !enabled.lines().any(|l| l.trim() == api) {
                        errors.push(format!("API {} is not enabled in project {}", api, self.0.project));
                    }
                }
            }
            Err(e) => errors.push(format!("Failed to list enabled APIs: {}", e)),
        }

        errors
    }

    async fn describe_service(&self, name: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        let output = self
            .0
            .cli
            .output(
                &self.0.argv(&["run", "services", "describe", name, "--format=json"], true),
                None,
            )
            .await?;
        if !output.success {
            if is_not_found(output.message()) {
                return Ok(None);
            }
            return Err(DeployError::provider(PLATFORM.as_str(), output.message()));
        }

        let service: Value = serde_json::from_str(&output.stdout)?;
        let mut snapshot = parse_knative_service(&service);

        if let Some(revision) = &snapshot.revision {
            let described: Result<Value, _> = self
                .0
                .cli
                .run_json(
                    &self.0.argv(&["run", "revisions", "describe", revision, "--format=json"], true),
                    None,
                )
                .await;
            if let Ok(rev) = described {
                snapshot.image_digest = rev
                    .pointer("/status/imageDigest")
                    .and_then(Value::as_str)
                    .and_then(|d| d.rsplit('@').next())
                    .map(str::to_string);
            }
        }
        Ok(Some(snapshot))
    }

    async fn deploy_service(&self, spec: &ServiceSpec) -> Result<(), DeployError> {
        let env_file = std::env::temp_dir().join(format!("cloud-run-env-{}.yaml", uuid::Uuid::new_v4()));
        let yaml = serde_yaml::to_string(&spec.env)
            .map_err(|e| DeployError::Internal(format!("env file encoding failed: {}", e)))?;
        tokio::fs::write(&env_file, yaml).await?;

        let port = spec.port.to_string();
        let mut argv = self.0.argv(
            &[
                "run",
                "deploy",
                &spec.name,
                "--image",
                &spec.image,
                "--port",
                &port,
                "--platform=managed",
                "--allow-unauthenticated",
            ],
            true,
        );
        argv.push(format!("--env-vars-file={}", env_file.display()));
        if spec.secrets.is_empty() {
            argv.push("--clear-secrets".to_string());
        } else {
            let refs: Vec<String> = spec
                .secrets
                .iter()
                .map(|(env_key, reference)| format!("{}={}", env_key, reference))
                .collect();
            argv.push(format!("--set-secrets={}", refs.join(",")));
        }

        let deployed = self.0.cli.run(&argv, None).await;
        let _ = tokio::fs::remove_file(&env_file).await;
        deployed?;

        self.0
            .cli
            .run(
                &self.0.argv(&["run", "services", "update-traffic", &spec.name, "--to-latest"], true),
                None,
            )
            .await?;
        Ok(())
    }

    async fn set_image(&self, name: &str, image: &str) -> Result<(), DeployError> {
        self.0
            .cli
            .run(&self.0.argv(&["run", "deploy", name, "--image", image], true), None)
            .await?;
        Ok(())
    }

    async fn route_traffic(&self, name: &str, revision: &str) -> Result<(), DeployError> {
        let target = format!("--to-revisions={}=100", revision);
        self.0
            .cli
            .run(
                &self.0.argv(&["run", "services", "update-traffic", name, &target], true),
                None,
            )
            .await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<bool, DeployError> {
        let output = self
            .0
            .cli
            .output(&self.0.argv(&["run", "services", "delete", name], true), None)
            .await?;
        if output.success {
            Ok(true)
        } else if is_not_found(output.message()) {
            Ok(false)
        } else {
            Err(DeployError::provider(PLATFORM.as_str(), output.message()))
        }
    }

    fn repository(&self, key: &StateKey) -> String {
        format!(
            "{}/{}/{}/{}",
            self.0.registry_host(),
            self.0.project,
            key.service_name,
            key.service_name
        )
    }

    async fn ensure_repository(&self, key: &StateKey) -> Result<(), DeployError> {
        let location = format!("--location={}", self.0.region);
        let exists = self
            .0
            .cli
            .output(
                &self.0.argv(&["artifacts", "repositories", "describe", &key.service_name, &location], false),
                None,
            )
            .await?;
        if !exists.success {
            if !is_not_found(exists.message()) {
                return Err(DeployError::provider(PLATFORM.as_str(), exists.message()));
            }
            self.0
                .cli
                .run(
                    &self.0.argv(
                        &[
                            "artifacts",
                            "repositories",
                            "create",
                            &key.service_name,
                            "--repository-format=docker",
                            &location,
                        ],
                        false,
                    ),
                    None,
                )
                .await?;
            info!(repository = %key.service_name, "Created Artifact Registry repository");
        }

        let host = self.0.registry_host();
        self.0
            .cli
            .run(&args(["auth", "configure-docker", &host, "--quiet"]), None)
            .await?;
        Ok(())
    }
}

/// Map a Knative service document onto the neutral snapshot
fn parse_knative_service(service: &Value) -> ServiceSnapshot {
    let text = |ptr: &str| service.pointer(ptr).and_then(Value::as_str).map(str::to_string);
    let name = text("/metadata/name").unwrap_or_default();
    let container = service.pointer("/spec/template/spec/containers/0");

    let mut env = BTreeMap::new();
    let mut secret_keys = Vec::new();
    if let Some(entries) = container.and_then(|c| c.get("env")).and_then(Value::as_array) {
        for entry in entries {
            let Some(key) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            if entry.get("valueFrom").is_some() {
                secret_keys.push(key.to_string());
            } else {
                let value = entry.get("value").and_then(Value::as_str).unwrap_or_default();
                env.insert(key.to_string(), value.to_string());
            }
        }
    }
    secret_keys.sort();

    let ready = service
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .and_then(|conds| {
            conds
                .iter()
                .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))
        });
    let phase = match ready.and_then(|c| c.get("status")).and_then(Value::as_str) {
        Some("True") => ServicePhase::Ready,
        Some("False") => ServicePhase::Failed(
            ready
                .and_then(|c| c.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("not ready")
                .to_string(),
        ),
        _ => ServicePhase::InProgress,
    };

    ServiceSnapshot {
        id: name.clone(),
        name,
        url: text("/status/url"),
        revision: text("/status/latestReadyRevisionName"),
        image: container
            .and_then(|c| c.get("image"))
            .and_then(Value::as_str)
            .map(str::to_string),
        image_digest: None,
        phase,
        env,
        secret_keys,
        port: container
            .and_then(|c| c.pointer("/ports/0/containerPort"))
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok()),
    }
}

/// GCP Secret Manager through `gcloud secrets`
struct SecretManagerStore(Gcloud);

#[async_trait]
impl SecretStore for SecretManagerStore {
    async fn upsert(&self, name: &str, value: &SecretString) -> Result<String, DeployError> {
        let gcloud = &self.0;
        let exists = gcloud
            .cli
            .output(&gcloud.argv(&["secrets", "describe", name], false), None)
            .await?;
        let payload = value.expose_secret().as_bytes();

        if exists.success {
            let current = gcloud
                .cli
                .output(
                    &gcloud.argv(&["secrets", "versions", "access", "latest", "--secret", name], false),
                    None,
                )
                .await?;
            let unchanged = current.success && current.stdout.as_bytes() == payload;
            if !unchanged {
                gcloud
                    .cli
                    .run(
                        &gcloud.argv(&["secrets", "versions", "add", name, "--data-file=-"], false),
                        Some(payload),
                    )
                    .await?;
            }
        } else if is_not_found(exists.message()) {
            gcloud
                .cli
                .run(
                    &gcloud.argv(
                        &["secrets", "create", name, "--replication-policy=automatic", "--data-file=-"],
                        false,
                    ),
                    Some(payload),
                )
                .await?;
        } else {
            return Err(DeployError::provider(PLATFORM.as_str(), exists.message()));
        }

        self.reference(name).await
    }

    async fn reference(&self, name: &str) -> Result<String, DeployError> {
        Ok(format!("{}:latest", name))
    }

    async fn delete(&self, name: &str) -> Result<bool, DeployError> {
        let output = self
            .0
            .cli
            .output(&self.0.argv(&["secrets", "delete", name], false), None)
            .await?;
        if output.success {
            info!(secret = %name, "Deleted secret");
            Ok(true)
        } else if is_not_found(output.message()) {
            Ok(false)
        } else {
            Err(DeployError::provider(PLATFORM.as_str(), output.message()))
        }
    }
}
