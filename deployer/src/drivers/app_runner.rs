//! AWS App Runner driver, backed by the `aws` CLI

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::info;

use crate::drivers::cli::{is_not_found, CliRunner};
use crate::drivers::{
    apply_secrets, build_plan, failure, plan_redactor, recorded_spec, service_spec,
    validate_desired, wait_until_ready, Driver, DriverConfig, ServicePhase, ServiceSnapshot,
    ServiceSpec,
};
use crate::errors::DeployError;
use crate::health::clock::Clock;
use crate::models::{
    ActionType, DeploymentPlan, DeploymentResult, DeploymentState, DeploymentStatus,
    DesiredService, Platform, ResourceAction, ResourceType, StateKey,
};
use crate::secrets::{owned_secret_names, Redactor, SecretStore};

const PLATFORM: Platform = Platform::AwsAppRunner;

/// App Runner and ECR operations the driver needs
#[async_trait]
pub trait AppRunnerApi: Send + Sync {
    async fn check_access(&self) -> Vec<String>;
    async fn find_service(&self, name: &str) -> Result<Option<ServiceSnapshot>, DeployError>;
    async fn describe_service(&self, arn: &str) -> Result<Option<ServiceSnapshot>, DeployError>;
    /// Returns the new service ARN
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, DeployError>;
    async fn update_service(&self, arn: &str, spec: &ServiceSpec) -> Result<(), DeployError>;
    /// Redeploy another image, keeping the rest of the configuration
    async fn set_image(&self, arn: &str, image: &str) -> Result<(), DeployError>;
    async fn delete_service(&self, arn: &str) -> Result<bool, DeployError>;
    async fn repository_uri(&self, name: &str) -> Result<String, DeployError>;
    async fn repository_exists(&self, name: &str) -> Result<bool, DeployError>;
    /// Create the ECR repository if missing and log docker in to the registry
    async fn ensure_repository(&self, name: &str) -> Result<(), DeployError>;
}

pub struct AppRunnerDriver {
    config: DriverConfig,
    api: Arc<dyn AppRunnerApi>,
    secrets: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
}

impl AppRunnerDriver {
    pub fn new(
        config: DriverConfig,
        api: Arc<dyn AppRunnerApi>,
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

    /// Driver talking to AWS through the `aws` CLI
    pub fn with_cli(config: DriverConfig, clock: Arc<dyn Clock>) -> Self {
        let aws = Aws::new(config.region.clone());
        let api = Arc::new(AwsAppRunner(aws.clone()));
        let secrets = Arc::new(SecretsManagerStore(aws));
        Self::new(config, api, secrets, clock)
    }

    async fn wait_ready(&self, arn: &str) -> Result<ServiceSnapshot, DeployError> {
        wait_until_ready(
            PLATFORM,
            self.clock.as_ref(),
            self.config.poll_interval,
            self.config.ready_timeout,
            || self.api.describe_service(arn),
        )
        .await
    }

    /// ARN of the live service, from state or by name
    async fn locate(&self, state: &DeploymentState) -> Result<Option<String>, DeployError> {
        if let Some(arn) = state.service_id() {
            if self.api.describe_service(arn).await?.is_some() {
                return Ok(Some(arn.to_string()));
            }
        }
        Ok(self
            .api
            .find_service(&state.key().provider_service_name())
            .await?
            .map(|s| s.id))
    }

    async fn apply(&self, plan: &DeploymentPlan) -> Result<DeploymentResult, (&'static str, DeployError)> {
        if plan.registry_action().map(|a| a.action) == Some(ActionType::Create) {
            self.api
                .ensure_repository(&plan.service_name)
                .await
                .map_err(|e| ("registry", e))?;
        }

        let refs = apply_secrets(self.secrets.as_ref(), plan)
            .await
            .map_err(|e| ("secrets", e))?;
        let mut spec = service_spec(plan, refs);

        let creating = plan.service_action().map(|a| a.action) == Some(ActionType::Create);
        let arn = match (&plan.current_service_id, creating) {
            (Some(arn), false) => {
                info!(service = %spec.name, image = %spec.image, "Updating App Runner service");
                self.api
                    .update_service(arn, &spec)
                    .await
                    .map_err(|e| ("update", e))?;
                arn.clone()
            }
            _ => {
                info!(service = %spec.name, image = %spec.image, "Creating App Runner service");
                self.api.create_service(&spec).await.map_err(|e| ("create", e))?
            }
        };

        let mut snapshot = self.wait_ready(&arn).await.map_err(|e| ("wait", e))?;
        if let Some(url) = snapshot.missing_public_url(&plan.public_url_var) {
            info!(service = %spec.name, url = %url, "Injecting public URL");
            spec.env.insert(plan.public_url_var.clone(), url);
            self.api
                .update_service(&arn, &spec)
                .await
                .map_err(|e| ("public_url", e))?;
            snapshot = self.wait_ready(&arn).await.map_err(|e| ("wait", e))?;
        }

        Ok(snapshot.to_result(plan.target_digest.as_deref()))
    }
}

#[async_trait]
impl Driver for AppRunnerDriver {
    fn platform(&self) -> Platform {
        PLATFORM
    }

    async fn check_prerequisites(&self) -> Vec<String> {
        self.api.check_access().await
    }

    async fn registry_repository(&self, key: &StateKey) -> Result<String, DeployError> {
        self.api.repository_uri(&key.service_name).await
    }

    async fn prepare_registry(&self, key: &StateKey) -> Result<(), DeployError> {
        self.api.ensure_repository(&key.service_name).await
    }

    async fn plan(
        &self,
        desired: &DesiredService,
        current: Option<&DeploymentState>,
    ) -> Result<DeploymentPlan, DeployError> {
        validate_desired(desired)?;

        let registry = if desired.managed_image {
            let repo = &desired.service_name;
            let (action, description) = if self.api.repository_exists(repo).await? {
                (ActionType::Noop, "ECR repository exists")
            } else {
                (ActionType::Create, "Create ECR repository")
            };
            Some(ResourceAction::new(
                ResourceType::RegistryRepo,
                action,
                repo,
                description,
            ))
        } else {
            None
        };

        let live = self
            .api
            .find_service(&desired.provider_service_name())
            .await?;
        Ok(build_plan(desired, current, live.as_ref(), registry))
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
        let redactor = Redactor::default();
        let key = state.key();

        match self.locate(state).await {
            Ok(Some(arn)) => match self.api.delete_service(&arn).await {
                Ok(_) => info!(service = %arn, "Deleted App Runner service"),
                Err(e) => return failure(&redactor, "delete_service", &e),
            },
            Ok(None) => info!(service = %key.provider_service_name(), "App Runner service already absent"),
            Err(e) => return failure(&redactor, "locate", &e),
        }

        for secret in owned_secret_names(&key, state.api_key_generated, state.rsa_key_generated) {
            if let Err(e) = self.secrets.delete(&secret).await {
                return failure(&redactor, "delete_secret", &e).with_detail("secret", secret);
            }
        }

        DeploymentResult::success(DeploymentStatus::Deleted)
    }

    async fn status(&self, state: &DeploymentState) -> DeploymentResult {
        let arn = match self.locate(state).await {
            Ok(Some(arn)) => arn,
            Ok(None) => {
                return DeploymentResult {
                    status: DeploymentStatus::Deleted,
                    ..DeploymentResult::failure("service not found at provider")
                }
            }
            Err(e) => return failure(&Redactor::default(), "locate", &e),
        };
        match self.api.describe_service(&arn).await {
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
        let arn = match self.locate(previous).await {
            Ok(Some(arn)) => arn,
            Ok(None) => return DeploymentResult::failure("service not found at provider"),
            Err(e) => return failure(&redactor, "locate", &e),
        };

        let applied = match recorded_spec(self.secrets.as_ref(), previous).await {
            Ok(Some(spec)) => {
                info!(service = %arn, image = %spec.image, "Re-applying previous configuration");
                self.api.update_service(&arn, &spec).await
            }
            Ok(None) => {
                info!(service = %arn, image = %previous.image_tag, "Redeploying previous image");
                self.api.set_image(&arn, &previous.image_tag).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            return failure(&redactor, "rollback", &e);
        }
        match self.wait_ready(&arn).await {
            Ok(snapshot) => {
                let mut result = snapshot.to_result(previous.image_digest.as_deref());
                result.status = DeploymentStatus::RolledBack;
                result
            }
            Err(e) => failure(&redactor, "rollback_wait", &e),
        }
    }
}

/// `aws` bound to one region
#[derive(Debug, Clone)]
struct Aws {
    cli: CliRunner,
    region: String,
}

impl Aws {
    fn new(region: String) -> Self {
        Self {
            cli: CliRunner::new("aws", PLATFORM),
            region,
        }
    }

    fn argv(&self, items: &[&str]) -> Vec<String> {
        let mut argv: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        argv.push(format!("--region={}", self.region));
        argv.push("--output=json".to_string());
        argv
    }

    async fn json(&self, items: &[&str], stdin: Option<&[u8]>) -> Result<Value, DeployError> {
        self.cli.run_json(&self.argv(items), stdin).await
    }

    /// Run; `Ok(None)` when AWS reports the resource missing
    async fn json_opt(&self, items: &[&str]) -> Result<Option<Value>, DeployError> {
        let output = self.cli.output(&self.argv(items), None).await?;
        if output.success {
            Ok(Some(serde_json::from_str(&output.stdout)?))
        } else if is_not_found(output.message()) {
            Ok(None)
        } else {
            Err(DeployError::provider(PLATFORM.as_str(), output.message()))
        }
    }

    async fn account_id(&self) -> Result<String, DeployError> {
        let identity = self.json(&["sts", "get-caller-identity"], None).await?;
        identity
            .get("Account")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DeployError::provider(PLATFORM.as_str(), "caller identity has no account"))
    }

    async fn registry_host(&self) -> Result<String, DeployError> {
        Ok(format!(
            "{}.dkr.ecr.{}.amazonaws.com",
            self.account_id().await?,
            self.region
        ))
    }
}

struct AwsAppRunner(Aws);

impl AwsAppRunner {
    async fn source_configuration(&self, spec: &ServiceSpec) -> Result<Value, DeployError> {
        let account = self.0.account_id().await?;
        let repository_type = if spec.image.starts_with("public.ecr.aws/") {
            "ECR_PUBLIC"
        } else {
            "ECR"
        };
        let mut source = json!({
            "ImageRepository": {
                "ImageIdentifier": spec.image,
                "ImageRepositoryType": repository_type,
                "ImageConfiguration": {
                    "Port": spec.port.to_string(),
                    "RuntimeEnvironmentVariables": spec.env,
                    "RuntimeEnvironmentSecrets": spec.secrets,
                }
            },
            "AutoDeploymentsEnabled": false,
        });
        if repository_type == "ECR" {
            source["AuthenticationConfiguration"] = json!({
                "AccessRoleArn": format!("arn:aws:iam::{}:role/service-role/AppRunnerECRAccessRole", account)
            });
        }
        Ok(source)
    }

    async fn instance_configuration(&self, spec: &ServiceSpec) -> Result<Option<Value>, DeployError> {
        if spec.secrets.is_empty() {
            return Ok(None);
        }
        let account = self.0.account_id().await?;
        Ok(Some(json!({
            "InstanceRoleArn": format!("arn:aws:iam::{}:role/AppRunnerInstanceRole", account)
        })))
    }

    async fn ecr_digest(&self, image: &str) -> Option<String> {
        let (repo_path, tag) = image.rsplit_once(':')?;
        let (host, repo) = repo_path.split_once('/')?;
        if !host.contains(".dkr.ecr.") {
            return None;
        }
        let image_id = format!("imageTag={}", tag);
        let details = self
            .0
            .json(
                &["ecr", "describe-images", "--repository-name", repo, "--image-ids", &image_id],
                None,
            )
            .await
            .ok()?;
        details
            .pointer("/imageDetails/0/imageDigest")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl AppRunnerApi for AwsAppRunner {
    async fn check_access(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.0.cli.probe(&["--version".to_string()]).await {
            errors.push("aws CLI not found or not working".to_string());
            return errors;
        }
        if let Err(e) = self.0.account_id().await {
            errors.push(format!("AWS credentials are not configured: {}", e));
        }
        errors
    }

    async fn find_service(&self, name: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        let listing = self.0.json(&["apprunner", "list-services"], None).await?;
        let arn = listing
            .get("ServiceSummaryList")
            .and_then(Value::as_array)
            .and_then(|items| {
                items.iter().find(|s| {
                    s.get("ServiceName").and_then(Value::as_str) == Some(name)
                        && s.get("Status").and_then(Value::as_str) != Some("DELETED")
                })
            })
            .and_then(|s| s.get("ServiceArn"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match arn {
            Some(arn) => self.describe_service(&arn).await,
            None => Ok(None),
        }
    }

    async fn describe_service(&self, arn: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        let Some(doc) = self
            .0
            .json_opt(&["apprunner", "describe-service", "--service-arn", arn])
            .await?
        else {
            return Ok(None);
        };
        let Some(service) = doc.get("Service") else {
            return Ok(None);
        };
        let mut snapshot = match parse_app_runner_service(service) {
            Some(snapshot) => snapshot,
            None => return Ok(None),
        };
        if let Some(image) = snapshot.image.clone() {
            snapshot.image_digest = self.ecr_digest(&image).await;
        }
        Ok(Some(snapshot))
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, DeployError> {
        let mut input = json!({
            "ServiceName": spec.name,
            "SourceConfiguration": self.source_configuration(spec).await?,
            "HealthCheckConfiguration": {"Protocol": "TCP"},
        });
        if let Some(instance) = self.instance_configuration(spec).await? {
            input["InstanceConfiguration"] = instance;
        }
        let body = serde_json::to_vec(&input)?;
        let created = self
            .0
            .json(
                &["apprunner", "create-service", "--cli-input-json", "file:///dev/stdin"],
                Some(&body),
            )
            .await?;
        created
            .pointer("/Service/ServiceArn")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DeployError::provider(PLATFORM.as_str(), "create-service returned no ARN"))
    }

    async fn update_service(&self, arn: &str, spec: &ServiceSpec) -> Result<(), DeployError> {
        let mut input = json!({
            "ServiceArn": arn,
            "SourceConfiguration": self.source_configuration(spec).await?,
        });
        if let Some(instance) = self.instance_configuration(spec).await? {
            input["InstanceConfiguration"] = instance;
        }
        let body = serde_json::to_vec(&input)?;
        self.0
            .json(
                &["apprunner", "update-service", "--cli-input-json", "file:///dev/stdin"],
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn set_image(&self, arn: &str, image: &str) -> Result<(), DeployError> {
        let doc = self
            .0
            .json(&["apprunner", "describe-service", "--service-arn", arn], None)
            .await?;
        let mut source = doc
            .pointer("/Service/SourceConfiguration")
            .cloned()
            .ok_or_else(|| DeployError::provider(PLATFORM.as_str(), "service has no source configuration"))?;
        source["ImageRepository"]["ImageIdentifier"] = Value::String(image.to_string());

        let body = serde_json::to_vec(&json!({
            "ServiceArn": arn,
            "SourceConfiguration": source,
        }))?;
        self.0
            .json(
                &["apprunner", "update-service", "--cli-input-json", "file:///dev/stdin"],
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn delete_service(&self, arn: &str) -> Result<bool, DeployError> {
        Ok(self
            .0
            .json_opt(&["apprunner", "delete-service", "--service-arn", arn])
            .await?
            .is_some())
    }

    async fn repository_uri(&self, name: &str) -> Result<String, DeployError> {
        Ok(format!("{}/{}", self.0.registry_host().await?, name))
    }

    async fn repository_exists(&self, name: &str) -> Result<bool, DeployError> {
        Ok(self
            .0
            .json_opt(&["ecr", "describe-repositories", "--repository-names", name])
            .await?
            .is_some())
    }

    async fn ensure_repository(&self, name: &str) -> Result<(), DeployError> {
        if !self.repository_exists(name).await? {
            self.0
                .json(&["ecr", "create-repository", "--repository-name", name], None)
                .await?;
            info!(repository = %name, "Created ECR repository");
        }

        let password = self
            .0
            .cli
            .run(&[
                "ecr".to_string(),
                "get-login-password".to_string(),
                format!("--region={}", self.0.region),
            ], None)
            .await?;
        let host = self.0.registry_host().await?;
        let docker = CliRunner::new("docker", PLATFORM);
        docker
            .run(
                &[
                    "login".to_string(),
                    "--username".to_string(),
                    "AWS".to_string(),
                    "--password-stdin".to_string(),
                    host,
                ],
                Some(password.trim().as_bytes()),
            )
            .await?;
        Ok(())
    }
}

/// Map an App Runner `Service` document onto the neutral snapshot
fn parse_app_runner_service(service: &Value) -> Option<ServiceSnapshot> {
    let text = |ptr: &str| service.pointer(ptr).and_then(Value::as_str).map(str::to_string);
    let status = text("/Status").unwrap_or_default();
    let phase = match status.as_str() {
        "RUNNING" => ServicePhase::Ready,
        "OPERATION_IN_PROGRESS" => ServicePhase::InProgress,
        "DELETED" => return None,
        other => ServicePhase::Failed(other.to_lowercase()),
    };

    let image_config = service.pointer("/SourceConfiguration/ImageRepository/ImageConfiguration");
    let env: BTreeMap<String, String> = image_config
        .and_then(|c| c.get("RuntimeEnvironmentVariables"))
        .and_then(Value::as_object)
        .map(|vars| {
            vars.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default();
    let mut secret_keys: Vec<String> = image_config
        .and_then(|c| c.get("RuntimeEnvironmentSecrets"))
        .and_then(Value::as_object)
        .map(|vars| vars.keys().cloned().collect())
        .unwrap_or_default();
    secret_keys.sort();

    Some(ServiceSnapshot {
        id: text("/ServiceArn")?,
        name: text("/ServiceName").unwrap_or_default(),
        url: text("/ServiceUrl").map(|host| {
            if host.starts_with("http") {
                host
            } else {
                format!("https://{}", host)
            }
        }),
        revision: None,
        image: text("/SourceConfiguration/ImageRepository/ImageIdentifier"),
        image_digest: None,
        phase,
        env,
        secret_keys,
        port: image_config
            .and_then(|c| c.get("Port"))
            .and_then(Value::as_str)
            .and_then(|p| p.parse().ok()),
    })
}

/// AWS Secrets Manager. Values travel on stdin via `--cli-input-json`.
struct SecretsManagerStore(Aws);

#[async_trait]
impl SecretStore for SecretsManagerStore {
    async fn upsert(&self, name: &str, value: &SecretString) -> Result<String, DeployError> {
        let existing = self
            .0
            .json_opt(&["secretsmanager", "describe-secret", "--secret-id", name])
            .await?;

        let Some(existing) = existing else {
            let body = serde_json::to_vec(&json!({
                "Name": name,
                "SecretString": value.expose_secret(),
            }))?;
            let created = self
                .0
                .json(
                    &["secretsmanager", "create-secret", "--cli-input-json", "file:///dev/stdin"],
                    Some(&body),
                )
                .await?;
            return arn_of(&created);
        };

        let current = self
            .0
            .json_opt(&["secretsmanager", "get-secret-value", "--secret-id", name])
            .await?;
        let unchanged = current
            .as_ref()
            .and_then(|c| c.get("SecretString"))
            .and_then(Value::as_str)
            == Some(value.expose_secret());
        if !unchanged {
            let body = serde_json::to_vec(&json!({
                "SecretId": name,
                "SecretString": value.expose_secret(),
            }))?;
            self.0
                .json(
                    &["secretsmanager", "put-secret-value", "--cli-input-json", "file:///dev/stdin"],
                    Some(&body),
                )
                .await?;
        }
        arn_of(&existing)
    }

    async fn reference(&self, name: &str) -> Result<String, DeployError> {
        let described = self
            .0
            .json(&["secretsmanager", "describe-secret", "--secret-id", name], None)
            .await?;
        arn_of(&described)
    }

    async fn delete(&self, name: &str) -> Result<bool, DeployError> {
        Ok(self
            .0
            .json_opt(&[
                "secretsmanager",
                "delete-secret",
                "--secret-id",
                name,
                "--force-delete-without-recovery",
            ])
            .await?
            .is_some())
    }
}

fn arn_of(doc: &Value) -> Result<String, DeployError> {
    doc.get("ARN")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DeployError::provider(PLATFORM.as_str(), "secret has no ARN"))
}
