//! DigitalOcean App Platform driver, backed by `doctl`.
//!
//! App Platform has no standalone secret store: secrets are `SECRET`-typed env
//! entries of the app spec, encrypted by DigitalOcean once applied. The adapter
//! therefore stages values in memory and the driver hands them over with the next
//! spec it submits. Entries that are not staged keep their encrypted value.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::info;

use crate::drivers::cli::{args, is_not_found, CliRunner};
use crate::drivers::{
    apply_secrets, build_plan, failure, plan_redactor, recorded_spec, service_spec,
    validate_desired, wait_until_ready, Driver, DriverConfig, ServicePhase, ServiceSnapshot,
    ServiceSpec, StagedSecrets,
};
use crate::errors::DeployError;
use crate::health::clock::Clock;
use crate::models::{
    ActionType, DeploymentPlan, DeploymentResult, DeploymentState, DeploymentStatus,
    DesiredService, Platform, ResourceAction, ResourceType, StateKey,
};
use crate::secrets::{Redactor, SecretStore};

const PLATFORM: Platform = Platform::DoAppPlatform;

/// Host of the DigitalOcean container registry
pub const DOCR_HOST: &str = "registry.digitalocean.com";

/// App Platform and registry operations the driver needs
#[async_trait]
pub trait AppPlatformApi: Send + Sync {
    async fn check_access(&self) -> Vec<String>;
    async fn find_app(&self, name: &str) -> Result<Option<ServiceSnapshot>, DeployError>;
    async fn get_app(&self, id: &str) -> Result<Option<ServiceSnapshot>, DeployError>;
    /// Returns the new app id
    async fn create_app(
        &self,
        spec: &ServiceSpec,
        secrets: &StagedSecrets,
    ) -> Result<String, DeployError>;
    async fn update_app(
        &self,
        id: &str,
        spec: &ServiceSpec,
        secrets: &StagedSecrets,
    ) -> Result<(), DeployError>;
    /// Redeploy another image, keeping the rest of the app spec
    async fn set_image(&self, id: &str, image: &str) -> Result<(), DeployError>;
    async fn delete_app(&self, id: &str) -> Result<bool, DeployError>;
    /// Name of the account's container registry, if one exists
    async fn registry_name(&self) -> Result<Option<String>, DeployError>;
    /// Create the registry if missing and log docker in to it
    async fn ensure_registry(&self, name: &str) -> Result<(), DeployError>;
}

/// In-memory secret staging for App Platform
#[derive(Default)]
pub struct AppPlatformSecrets {
    staged: Mutex<StagedSecrets>,
}

impl AppPlatformSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain staged values for the next spec submission
    pub fn take_staged(&self) -> StagedSecrets {
        self.staged
            .lock()
            .map(|mut staged| std::mem::take(&mut *staged))
            .unwrap_or_default()
    }
}

#[async_trait]
impl SecretStore for AppPlatformSecrets {
    async fn upsert(&self, name: &str, value: &SecretString) -> Result<String, DeployError> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| DeployError::Internal("secret staging lock poisoned".to_string()))?;
        staged.insert(name.to_string(), value.clone());
        Ok(name.to_string())
    }

    async fn reference(&self, name: &str) -> Result<String, DeployError> {
        Ok(name.to_string())
    }

    /// Only unsubmitted values can be removed here; applied ones live in the app spec.
    async fn delete(&self, name: &str) -> Result<bool, DeployError> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| DeployError::Internal("secret staging lock poisoned".to_string()))?;
        Ok(staged.remove(name).is_some())
    }
}

pub struct AppPlatformDriver {
    config: DriverConfig,
    api: Arc<dyn AppPlatformApi>,
    secrets: Arc<AppPlatformSecrets>,
    clock: Arc<dyn Clock>,
}

impl AppPlatformDriver {
    pub fn new(config: DriverConfig, api: Arc<dyn AppPlatformApi>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            api,
            secrets: Arc::new(AppPlatformSecrets::new()),
            clock,
        }
    }

    /// Driver talking to DigitalOcean through `doctl`
    pub fn with_cli(config: DriverConfig, clock: Arc<dyn Clock>) -> Self {
        let api = Arc::new(Doctl::new(config.region.clone()));
        Self::new(config, api, clock)
    }

    async fn wait_ready(&self, id: &str) -> Result<ServiceSnapshot, DeployError> {
        wait_until_ready(
            PLATFORM,
            self.clock.as_ref(),
            self.config.poll_interval,
            self.config.ready_timeout,
            || self.api.get_app(id),
        )
        .await
    }

    async fn locate(&self, state: &DeploymentState) -> Result<Option<String>, DeployError> {
        if let Some(id) = state.service_id() {
            if self.api.get_app(id).await?.is_some() {
                return Ok(Some(id.to_string()));
            }
        }
        Ok(self
            .api
            .find_app(&state.key().provider_service_name())
            .await?
            .map(|s| s.id))
    }

    async fn registry(&self, key: &StateKey) -> Result<String, DeployError> {
        Ok(self
            .api
            .registry_name()
            .await?
            .unwrap_or_else(|| key.service_name.clone()))
    }

    async fn apply(&self, plan: &DeploymentPlan) -> Result<DeploymentResult, (&'static str, DeployError)> {
        if let Some(registry) = plan.registry_action() {
            if registry.action == ActionType::Create {
                self.api
                    .ensure_registry(&registry.name)
                    .await
                    .map_err(|e| ("registry", e))?;
            }
        }

        let refs = apply_secrets(self.secrets.as_ref(), plan)
            .await
            .map_err(|e| ("secrets", e))?;
        let staged = self.secrets.take_staged();
        let mut spec = service_spec(plan, refs);

        let creating = plan.service_action().map(|a| a.action) == Some(ActionType::Create);
        let id = match (&plan.current_service_id, creating) {
            (Some(id), false) => {
                info!(app = %spec.name, image = %spec.image, "Updating App Platform app");
                self.api
                    .update_app(id, &spec, &staged)
                    .await
                    .map_err(|e| ("update", e))?;
                id.clone()
            }
            _ => {
                info!(app = %spec.name, image = %spec.image, "Creating App Platform app");
                self.api
                    .create_app(&spec, &staged)
                    .await
                    .map_err(|e| ("create", e))?
            }
        };

        let mut snapshot = self.wait_ready(&id).await.map_err(|e| ("wait", e))?;
        if let Some(url) = snapshot.missing_public_url(&plan.public_url_var) {
            info!(app = %spec.name, url = %url, "Injecting public URL");
            spec.env.insert(plan.public_url_var.clone(), url);
            self.api
                .update_app(&id, &spec, &StagedSecrets::new())
                .await
                .map_err(|e| ("public_url", e))?;
            snapshot = self.wait_ready(&id).await.map_err(|e| ("wait", e))?;
        }

        Ok(snapshot.to_result(plan.target_digest.as_deref()))
    }
}

#[async_trait]
impl Driver for AppPlatformDriver {
    fn platform(&self) -> Platform {
        PLATFORM
    }

    async fn check_prerequisites(&self) -> Vec<String> {
        self.api.check_access().await
    }

    async fn registry_repository(&self, key: &StateKey) -> Result<String, DeployError> {
        Ok(format!(
            "{}/{}/{}",
            DOCR_HOST,
            self.registry(key).await?,
            key.service_name
        ))
    }

    async fn prepare_registry(&self, key: &StateKey) -> Result<(), DeployError> {
        let name = self.registry(key).await?;
        self.api.ensure_registry(&name).await
    }

    async fn plan(
        &self,
        desired: &DesiredService,
        current: Option<&DeploymentState>,
    ) -> Result<DeploymentPlan, DeployError> {
        validate_desired(desired)?;

        let registry = if desired.managed_image {
            let action = match self.api.registry_name().await? {
                Some(name) => ResourceAction::new(
                    ResourceType::RegistryRepo,
                    ActionType::Noop,
                    name,
                    "Container registry exists",
                ),
                None => ResourceAction::new(
                    ResourceType::RegistryRepo,
                    ActionType::Create,
                    &desired.service_name,
                    "Create container registry",
                ),
            };
            Some(action)
        } else {
            None
        };

        let live = self.api.find_app(&desired.provider_service_name()).await?;
        Ok(build_plan(desired, current, live.as_ref(), registry))
    }

    async fn up(&self, plan: &DeploymentPlan) -> DeploymentResult {
        let started = self.clock.elapsed();
        let redactor = plan_redactor(plan);
        let result = match self.apply(plan).await {
            Ok(result) => result,
            Err((step, err)) => {
                // Nothing staged may outlive a failed submission.
                let _ = self.secrets.take_staged();
                failure(&redactor, step, &err)
            }
        };
        result.with_elapsed(self.clock.elapsed().saturating_sub(started))
    }

    /// Secrets are part of the app spec and go away with the app.
    async fn down(&self, state: &DeploymentState) -> DeploymentResult {
        let redactor = Redactor::default();
        match self.locate(state).await {
            Ok(Some(id)) => match self.api.delete_app(&id).await {
                Ok(_) => info!(app = %id, "Deleted App Platform app and its secrets"),
                Err(e) => return failure(&redactor, "delete_app", &e),
            },
            Ok(None) => info!(app = %state.key().provider_service_name(), "App Platform app already absent"),
            Err(e) => return failure(&redactor, "locate", &e),
        }
        DeploymentResult::success(DeploymentStatus::Deleted)
    }

    async fn status(&self, state: &DeploymentState) -> DeploymentResult {
        let id = match self.locate(state).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                return DeploymentResult {
                    status: DeploymentStatus::Deleted,
                    ..DeploymentResult::failure("service not found at provider")
                }
            }
            Err(e) => return failure(&Redactor::default(), "locate", &e),
        };
        match self.api.get_app(&id).await {
            Ok(Some(snapshot)) => snapshot.to_result(None),
            Ok(None) => DeploymentResult {
                status: DeploymentStatus::Deleted,
                ..DeploymentResult::failure("service not found at provider")
            },
            Err(e) => failure(&Redactor::default(), "describe", &e),
        }
    }

    async fn rollback(&self, previous: &DeploymentState) -> DeploymentResult {
        let redactor = Redactor::default();
        let id = match self.locate(previous).await {
            Ok(Some(id)) => id,
            Ok(None) => return DeploymentResult::failure("service not found at provider"),
            Err(e) => return failure(&redactor, "locate", &e),
        };

        // Unstaged secret entries keep the values App Platform already holds.
        let applied = match recorded_spec(self.secrets.as_ref(), previous).await {
            Ok(Some(spec)) => {
                info!(app = %id, image = %spec.image, "Re-applying previous app spec");
                self.api.update_app(&id, &spec, &StagedSecrets::new()).await
            }
            Ok(None) => {
                info!(app = %id, image = %previous.image_tag, "Redeploying previous image");
                self.api.set_image(&id, &previous.image_tag).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            return failure(&redactor, "rollback", &e);
        }
        match self.wait_ready(&id).await {
            Ok(snapshot) => {
                let mut result = snapshot.to_result(previous.image_digest.as_deref());
                result.status = DeploymentStatus::RolledBack;
                result
            }
            Err(e) => failure(&redactor, "rollback_wait", &e),
        }
    }
}

/// Image reference split into App Platform's image spec fields
fn image_spec(image: &str) -> Value {
    let (path, tag) = match image.rsplit_once(':') {
        Some((path, tag)) if !tag.contains('/') => (path, tag),
        _ => (image, "latest"),
    };

    if let Some(rest) = path.strip_prefix(&format!("{}/", DOCR_HOST)) {
        let (registry, repository) = rest.split_once('/').unwrap_or(("", rest));
        return json!({
            "registry_type": "DOCR",
            "registry": registry,
            "repository": repository,
            "tag": tag,
        });
    }
    if let Some(rest) = path.strip_prefix("ghcr.io/") {
        let (registry, repository) = rest.split_once('/').unwrap_or(("", rest));
        return json!({
            "registry_type": "GHCR",
            "registry": registry,
            "repository": repository,
            "tag": tag,
        });
    }

    let path = path.strip_prefix("docker.io/").unwrap_or(path);
    let (registry, repository) = path.split_once('/').unwrap_or(("library", path));
    json!({
        "registry_type": "DOCKER_HUB",
        "registry": registry,
        "repository": repository,
        "tag": tag,
    })
}

/// Inverse of [`image_spec`]
fn image_ref(spec: &Value) -> Option<String> {
    let field = |k: &str| spec.get(k).and_then(Value::as_str).unwrap_or_default();
    let repository = spec.get("repository")?.as_str()?;
    let tag = match field("tag") {
        "" => "latest",
        tag => tag,
    };
    let prefix = match field("registry_type") {
        "DOCR" => format!("{}/{}/", DOCR_HOST, field("registry")),
        "GHCR" => format!("ghcr.io/{}/", field("registry")),
        _ if field("registry").is_empty() => String::new(),
        _ => format!("{}/", field("registry")),
    };
    Some(format!("{}{}:{}", prefix, repository, tag))
}

/// App Platform region slug for a datacenter region (`nyc3` -> `nyc`)
fn app_region(region: &str) -> String {
    region
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect()
}

/// Build the app spec. Secret entries without a staged value reuse `existing`.
fn app_spec(
    spec: &ServiceSpec,
    region: &str,
    secrets: &StagedSecrets,
    existing: Option<&Value>,
) -> Value {
    let existing_secret = |key: &str| -> Option<Value> {
        existing?
            .pointer("/services/0/envs")?
            .as_array()?
            .iter()
            .find(|e| e.get("key").and_then(Value::as_str) == Some(key))
            .and_then(|e| e.get("value").cloned())
    };

    let mut envs: Vec<Value> = spec
        .env
        .iter()
        .map(|(key, value)| {
            json!({"key": key, "value": value, "scope": "RUN_TIME", "type": "GENERAL"})
        })
        .collect();
    for (env_key, secret_name) in &spec.secrets {
        let value = match secrets.get(secret_name) {
            Some(value) => Value::String(value.expose_secret().to_string()),
            None => existing_secret(env_key).unwrap_or(Value::Null),
        };
        envs.push(json!({"key": env_key, "value": value, "scope": "RUN_TIME", "type": "SECRET"}));
    }

    json!({
        "name": spec.name,
        "region": app_region(region),
        "services": [{
            "name": spec.name,
            "image": image_spec(&spec.image),
            "http_port": spec.port,
            "instance_count": 1,
            "instance_size_slug": "basic-xxs",
            "envs": envs,
        }],
    })
}

/// Map a `doctl apps get` document onto the neutral snapshot
fn parse_app(app: &Value) -> Option<ServiceSnapshot> {
    let text = |ptr: &str| app.pointer(ptr).and_then(Value::as_str).map(str::to_string);
    let service = app.pointer("/spec/services/0");

    let mut env = BTreeMap::new();
    let mut secret_keys = Vec::new();
    if let Some(entries) = service.and_then(|s| s.get("envs")).and_then(Value::as_array) {
        for entry in entries {
            let Some(key) = entry.get("key").and_then(Value::as_str) else {
                continue;
            };
            if entry.get("type").and_then(Value::as_str) == Some("SECRET") {
                secret_keys.push(key.to_string());
            } else {
                let value = entry.get("value").and_then(Value::as_str).unwrap_or_default();
                env.insert(key.to_string(), value.to_string());
            }
        }
    }
    secret_keys.sort();

    let active_phase = text("/active_deployment/phase");
    let in_progress = app.get("in_progress_deployment").is_some_and(|d| !d.is_null())
        || app.get("pending_deployment").is_some_and(|d| !d.is_null());
    let failed_phase = text("/in_progress_deployment/phase")
        .filter(|p| matches!(p.as_str(), "ERROR" | "CANCELED"));

    let phase = if let Some(phase) = failed_phase {
        ServicePhase::Failed(phase.to_lowercase())
    } else if in_progress {
        ServicePhase::InProgress
    } else {
        match active_phase.as_deref() {
            Some("ACTIVE") => ServicePhase::Ready,
            Some("ERROR") | Some("CANCELED") => {
                ServicePhase::Failed(active_phase.unwrap_or_default().to_lowercase())
            }
            _ => ServicePhase::InProgress,
        }
    };

    Some(ServiceSnapshot {
        id: text("/id")?,
        name: text("/spec/name").unwrap_or_default(),
        url: text("/live_url").filter(|u| !u.is_empty()),
        revision: text("/active_deployment/id"),
        image: service.and_then(|s| s.get("image")).and_then(image_ref),
        image_digest: None,
        phase,
        env,
        secret_keys,
        port: service
            .and_then(|s| s.get("http_port"))
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok()),
    })
}

/// `doctl` client
struct Doctl {
    cli: CliRunner,
    region: String,
}

impl Doctl {
    fn new(region: String) -> Self {
        Self {
            cli: CliRunner::new("doctl", PLATFORM),
            region,
        }
    }

    fn argv(items: &[&str]) -> Vec<String> {
        let mut argv: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        argv.push("--output=json".to_string());
        argv
    }

    /// `doctl apps get`, raw
    async fn app_document(&self, id: &str) -> Result<Option<Value>, DeployError> {
        let output = self
            .cli
            .output(&Self::argv(&["apps", "get", id]), None)
            .await?;
        if !output.success {
            if is_not_found(output.message()) {
                return Ok(None);
            }
            return Err(DeployError::provider(PLATFORM.as_str(), output.message()));
        }
        let doc: Value = serde_json::from_str(&output.stdout)?;
        Ok(first(doc))
    }

    async fn docr_digest(&self, image: &str) -> Option<String> {
        let rest = image.strip_prefix(&format!("{}/", DOCR_HOST))?;
        let (_registry, repo_tag) = rest.split_once('/')?;
        let (repository, tag) = repo_tag.rsplit_once(':')?;
        let tags: Value = self
            .cli
            .run_json(&Self::argv(&["registry", "repository", "list-tags", repository]), None)
            .await
            .ok()?;
        tags.as_array()?
            .iter()
            .find(|t| t.get("tag").and_then(Value::as_str) == Some(tag))
            .and_then(|t| t.get("manifest_digest"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    async fn snapshot(&self, doc: &Value) -> Option<ServiceSnapshot> {
        let mut snapshot = parse_app(doc)?;
        if let Some(image) = snapshot.image.clone() {
            snapshot.image_digest = self.docr_digest(&image).await;
        }
        Some(snapshot)
    }
}

/// doctl wraps single objects in an array
fn first(doc: Value) -> Option<Value> {
    match doc {
        Value::Array(mut items) if !items.is_empty() => Some(items.swap_remove(0)),
        Value::Array(_) | Value::Null => None,
        other => Some(other),
    }
}

#[async_trait]
impl AppPlatformApi for Doctl {
    async fn check_access(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.cli.probe(&args(["version"])).await {
            errors.push("doctl CLI not found or not working".to_string());
            return errors;
        }
        if !self.cli.probe(&Self::argv(&["account", "get"])).await {
            errors.push("doctl is not authenticated (run `doctl auth init`)".to_string());
        }
        errors
    }

    async fn find_app(&self, name: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        let apps: Value = self
            .cli
            .run_json(&Self::argv(&["apps", "list"]), None)
            .await?;
        let Some(app) = apps.as_array().and_then(|items| {
            items
                .iter()
                .find(|a| a.pointer("/spec/name").and_then(Value::as_str) == Some(name))
        }) else {
            return Ok(None);
        };
        Ok(self.snapshot(app).await)
    }

    async fn get_app(&self, id: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        match self.app_document(id).await? {
            Some(doc) => Ok(self.snapshot(&doc).await),
            None => Ok(None),
        }
    }

    async fn create_app(
        &self,
        spec: &ServiceSpec,
        secrets: &StagedSecrets,
    ) -> Result<String, DeployError> {
        let body = serde_json::to_vec(&app_spec(spec, &self.region, secrets, None))?;
        let created: Value = self
            .cli
            .run_json(
                &Self::argv(&["apps", "create", "--spec", "-", "--wait=false"]),
                Some(&body),
            )
            .await?;
        first(created)
            .and_then(|app| app.get("id").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| DeployError::provider(PLATFORM.as_str(), "apps create returned no id"))
    }

    async fn update_app(
        &self,
        id: &str,
        spec: &ServiceSpec,
        secrets: &StagedSecrets,
    ) -> Result<(), DeployError> {
        let existing = self.app_document(id).await?;
        let existing_spec = existing.as_ref().and_then(|doc| doc.get("spec"));
        let body = serde_json::to_vec(&app_spec(spec, &self.region, secrets, existing_spec))?;
        self.cli
            .run(&Self::argv(&["apps", "update", id, "--spec", "-"]), Some(&body))
            .await?;
        Ok(())
    }

    async fn set_image(&self, id: &str, image: &str) -> Result<(), DeployError> {
        let doc = self
            .app_document(id)
            .await?
            .ok_or_else(|| DeployError::provider(PLATFORM.as_str(), format!("app {} not found", id)))?;
        let mut spec = doc
            .get("spec")
            .cloned()
            .ok_or_else(|| DeployError::provider(PLATFORM.as_str(), "app has no spec"))?;
        if let Some(service) = spec.pointer_mut("/services/0") {
            service["image"] = image_spec(image);
        }
        let body = serde_json::to_vec(&spec)?;
        self.cli
            .run(&Self::argv(&["apps", "update", id, "--spec", "-"]), Some(&body))
            .await?;
        Ok(())
    }

    async fn delete_app(&self, id: &str) -> Result<bool, DeployError> {
        let output = self
            .cli
            .output(&args(["apps", "delete", id, "--force"]), None)
            .await?;
        if output.success {
            Ok(true)
        } else if is_not_found(output.message()) {
            Ok(false)
        } else {
            Err(DeployError::provider(PLATFORM.as_str(), output.message()))
        }
    }

    async fn registry_name(&self) -> Result<Option<String>, DeployError> {
        let output = self
            .cli
            .output(&Self::argv(&["registry", "get"]), None)
            .await?;
        if !output.success {
            if is_not_found(output.message()) {
                return Ok(None);
            }
            return Err(DeployError::provider(PLATFORM.as_str(), output.message()));
        }
        let doc: Value = serde_json::from_str(&output.stdout)?;
        Ok(first(doc).and_then(|r| r.get("name").and_then(Value::as_str).map(str::to_string)))
    }

    async fn ensure_registry(&self, name: &str) -> Result<(), DeployError> {
        if self.registry_name().await?.is_none() {
            self.cli
                .run(&Self::argv(&["registry", "create", name]), None)
                .await?;
            info!(registry = %name, "Created container registry");
        }
        self.cli.run(&args(["registry", "login"]), None).await?;
        Ok(())
    }
}
