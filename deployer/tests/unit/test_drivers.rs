//! Cloud Run and App Platform drivers against in-memory provider APIs

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use agent_deployer::drivers::app_platform::{AppPlatformApi, AppPlatformDriver};
use agent_deployer::drivers::cloud_run::{CloudRunApi, CloudRunDriver};
use agent_deployer::drivers::{
    Driver, DriverConfig, ServicePhase, ServiceSnapshot, ServiceSpec, StagedSecrets,
};
use agent_deployer::errors::DeployError;
use agent_deployer::health::{Clock, ManualClock};
use agent_deployer::models::state::provider_keys;
use agent_deployer::models::{
    ActionType, DeploymentState, DeploymentStatus, DesiredService, Environment, HealthStatus,
    Platform, ResourceType, StateKey,
};
use agent_deployer::secrets::{DesiredSecret, GeneratedSecret};

use crate::support::FakeSecrets;

fn create_desired(platform: Platform, image: &str) -> DesiredService {
    DesiredService {
        service_name: "foo".to_string(),
        environment: Environment::Prod,
        platform,
        region: platform.default_region().to_string(),
        project_id: (platform == Platform::CloudRun).then(|| "proj".to_string()),
        image: image.to_string(),
        image_digest: None,
        managed_image: false,
        port: 8080,
        env: BTreeMap::from([("SERVICE_ENVIRONMENT".to_string(), "prod".to_string())]),
        secrets: vec![DesiredSecret::user(
            "DATABASE_URL",
            SecretString::from("postgres://u:pw@db/foo".to_string()),
        )],
        public_url_var: "SERVICE_PUBLIC_URL".to_string(),
        force: false,
    }
}

fn recorded_state(platform: Platform, revision: Option<&str>) -> DeploymentState {
    DeploymentState {
        version: 2,
        service_name: "foo".to_string(),
        platform,
        environment: Environment::Prod,
        region: platform.default_region().to_string(),
        project_id: None,
        image_tag: "registry.example.com/foo:good".to_string(),
        image_digest: Some("sha256:good".to_string()),
        service_url: Some("https://foo-prod.example.com".to_string()),
        revision: revision.map(str::to_string),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        status: DeploymentStatus::Running,
        health_status: HealthStatus::Healthy,
        port: 8080,
        api_key_generated: false,
        rsa_key_generated: false,
        provider_data: BTreeMap::new(),
    }
}

fn snapshot(id: &str, spec: &ServiceSpec, revision: String) -> ServiceSnapshot {
    ServiceSnapshot {
        id: id.to_string(),
        name: spec.name.clone(),
        url: Some(format!("https://{}.example.com", spec.name)),
        revision: Some(revision),
        image: Some(spec.image.clone()),
        image_digest: None,
        phase: ServicePhase::Ready,
        env: spec.env.clone(),
        secret_keys: spec.secrets.keys().cloned().collect(),
        port: Some(spec.port),
    }
}

/// Recorded state that also carries the applied env and secret names
fn recorded_config(platform: Platform) -> DeploymentState {
    let mut state = recorded_state(platform, None);
    state.set_provider_value(
        provider_keys::ENV_VARS,
        json!({
            "SERVICE_ENVIRONMENT": "prod",
            "SERVICE_PUBLIC_URL": "https://foo-prod.example.com",
        }),
    );
    state.set_provider_value(
        provider_keys::SECRET_NAMES,
        json!({ "DATABASE_URL": "foo-prod-database-url" }),
    );
    state
}

// =============================== CLOUD RUN ================================ //

#[derive(Default)]
struct FakeCloudRun {
    services: Mutex<BTreeMap<String, ServiceSnapshot>>,
    calls: Mutex<Vec<String>>,
    deploys: Mutex<u32>,
}

impl FakeCloudRun {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn seed(&self, name: &str, image: &str, revision: &str) {
        let spec = ServiceSpec {
            name: name.to_string(),
            image: image.to_string(),
            port: 8080,
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
        };
        self.services
            .lock()
            .unwrap()
            .insert(name.to_string(), snapshot(name, &spec, revision.to_string()));
    }
}

#[async_trait]
impl CloudRunApi for FakeCloudRun {
    async fn check_access(&self) -> Vec<String> {
        Vec::new()
    }

    async fn describe_service(&self, name: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        Ok(self.services.lock().unwrap().get(name).cloned())
    }

    async fn deploy_service(&self, spec: &ServiceSpec) -> Result<(), DeployError> {
        let revision = {
            let mut deploys = self.deploys.lock().unwrap();
            *deploys += 1;
            format!("{}-{:05}", spec.name, *deploys)
        };
        self.services
            .lock()
            .unwrap()
            .insert(spec.name.clone(), snapshot(&spec.name, spec, revision));
        self.record(format!("deploy_service:{}", spec.name));
        Ok(())
    }

    async fn set_image(&self, name: &str, image: &str) -> Result<(), DeployError> {
        if let Some(service) = self.services.lock().unwrap().get_mut(name) {
            service.image = Some(image.to_string());
        }
        self.record(format!("set_image:{}", image));
        Ok(())
    }

    async fn route_traffic(&self, name: &str, revision: &str) -> Result<(), DeployError> {
        if let Some(service) = self.services.lock().unwrap().get_mut(name) {
            service.revision = Some(revision.to_string());
        }
        self.record(format!("route_traffic:{}", revision));
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<bool, DeployError> {
        self.record(format!("delete_service:{}", name));
        Ok(self.services.lock().unwrap().remove(name).is_some())
    }

    fn repository(&self, key: &StateKey) -> String {
        format!("us-central1-docker.pkg.dev/proj/{}/{}", key.service_name, key.service_name)
    }

    async fn ensure_repository(&self, key: &StateKey) -> Result<(), DeployError> {
        self.record(format!("ensure_repository:{}", key.service_name));
        Ok(())
    }
}

fn cloud_run() -> (CloudRunDriver, Arc<FakeCloudRun>, Arc<FakeSecrets>) {
    let api = Arc::new(FakeCloudRun::default());
    let secrets = Arc::new(FakeSecrets::default());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let driver = CloudRunDriver::new(
        DriverConfig::new("us-central1", Some("proj".to_string())),
        api.clone(),
        secrets.clone(),
        clock,
    );
    (driver, api, secrets)
}

#[tokio::test]
async fn test_cloud_run_up_injects_public_url() {
    let (driver, api, secrets) = cloud_run();
    let desired = create_desired(Platform::CloudRun, "us-central1-docker.pkg.dev/proj/foo/foo:v1");

    let plan = driver.plan(&desired, None).await.unwrap();
    let result = driver.up(&plan).await;

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.service_url.as_deref(), Some("https://foo-prod.example.com"));
    assert_eq!(result.revision.as_deref(), Some("foo-prod-00002"));
    assert_eq!(
        api.calls(),
        vec!["deploy_service:foo-prod".to_string(), "deploy_service:foo-prod".to_string()]
    );
    assert_eq!(secrets.upserts(), vec!["foo-prod-database-url".to_string()]);
    let live = api.describe_service("foo-prod").await.unwrap().unwrap();
    assert_eq!(
        live.env.get("SERVICE_PUBLIC_URL").map(String::as_str),
        Some("https://foo-prod.example.com")
    );
}

#[tokio::test]
async fn test_cloud_run_rollback_routes_traffic_to_recorded_revision() {
    let (driver, api, _secrets) = cloud_run();
    api.seed("foo-prod", "registry.example.com/foo:bad", "foo-prod-00007");

    let result = driver
        .rollback(&recorded_state(Platform::CloudRun, Some("foo-prod-00006")))
        .await;

    assert!(result.success);
    assert_eq!(result.status, DeploymentStatus::RolledBack);
    assert_eq!(result.revision.as_deref(), Some("foo-prod-00006"));
    assert_eq!(result.image_digest.as_deref(), Some("sha256:good"));
    assert_eq!(api.calls(), vec!["route_traffic:foo-prod-00006".to_string()]);
}

#[tokio::test]
async fn test_cloud_run_rollback_without_revision_redeploys_image() {
    let (driver, api, _secrets) = cloud_run();
    api.seed("foo-prod", "registry.example.com/foo:bad", "foo-prod-00007");

    let result = driver.rollback(&recorded_state(Platform::CloudRun, None)).await;

    assert!(result.success);
    assert_eq!(
        api.calls(),
        vec!["set_image:registry.example.com/foo:good".to_string()]
    );
}

#[tokio::test]
async fn test_cloud_run_rollback_without_revision_restores_configuration() {
    let (driver, api, secrets) = cloud_run();
    secrets.insert("foo-prod-database-url", "postgres://u:pw@db/foo");
    api.seed("foo-prod", "registry.example.com/foo:bad", "foo-prod-00007");

    let result = driver.rollback(&recorded_config(Platform::CloudRun)).await;

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(api.calls(), vec!["deploy_service:foo-prod".to_string()]);
    let live = api.describe_service("foo-prod").await.unwrap().unwrap();
    assert_eq!(live.image.as_deref(), Some("registry.example.com/foo:good"));
    assert_eq!(live.port, Some(8080));
    assert_eq!(
        live.env.get("SERVICE_PUBLIC_URL").map(String::as_str),
        Some("https://foo-prod.example.com")
    );
    assert_eq!(live.secret_keys, vec!["DATABASE_URL".to_string()]);
}

#[tokio::test]
async fn test_cloud_run_rollback_fails_when_recorded_secret_is_gone() {
    let (driver, api, _secrets) = cloud_run();
    api.seed("foo-prod", "registry.example.com/foo:bad", "foo-prod-00007");

    let result = driver.rollback(&recorded_config(Platform::CloudRun)).await;

    assert!(!result.success);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn test_cloud_run_down_deletes_owned_secrets_only() {
    let (driver, api, secrets) = cloud_run();
    api.seed("foo-prod", "registry.example.com/foo:good", "foo-prod-00001");
    secrets.insert("foo-prod-api-key", "generated");
    secrets.insert("foo-prod-rsa-key", "generated");
    secrets.insert("foo-prod-database-url", "user supplied");

    let mut state = recorded_state(Platform::CloudRun, None);
    state.api_key_generated = true;
    let result = driver.down(&state).await;

    assert!(result.success);
    assert_eq!(result.status, DeploymentStatus::Deleted);
    assert_eq!(secrets.deletes(), vec!["foo-prod-api-key".to_string()]);
    assert_eq!(
        secrets.names(),
        vec!["foo-prod-database-url".to_string(), "foo-prod-rsa-key".to_string()]
    );

    // already gone is still success
    let result = driver.down(&state).await;
    assert!(result.success);
}

#[tokio::test]
async fn test_cloud_run_status_of_missing_service() {
    let (driver, _api, _secrets) = cloud_run();
    let result = driver.status(&recorded_state(Platform::CloudRun, None)).await;
    assert!(!result.success);
    assert_eq!(result.status, DeploymentStatus::Deleted);
}

// ============================= APP PLATFORM =============================== //

#[derive(Default)]
struct FakeAppPlatform {
    apps: Mutex<BTreeMap<String, ServiceSnapshot>>,
    /// (call, staged secret name -> value)
    submissions: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    registry: Mutex<Option<String>>,
}

impl FakeAppPlatform {
    fn submissions(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.submissions.lock().unwrap().clone()
    }

    fn submit(&self, call: &str, staged: &StagedSecrets) {
        let values = staged
            .iter()
            .map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
            .collect();
        self.submissions.lock().unwrap().push((call.to_string(), values));
    }
}

#[async_trait]
impl AppPlatformApi for FakeAppPlatform {
    async fn check_access(&self) -> Vec<String> {
        Vec::new()
    }

    async fn find_app(&self, name: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        Ok(self
            .apps
            .lock()
            .unwrap()
            .values()
            .find(|a| a.name == name)
            .cloned())
    }

    async fn get_app(&self, id: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        Ok(self.apps.lock().unwrap().get(id).cloned())
    }

    async fn create_app(
        &self,
        spec: &ServiceSpec,
        secrets: &StagedSecrets,
    ) -> Result<String, DeployError> {
        let id = format!("app-{}", spec.name);
        self.apps
            .lock()
            .unwrap()
            .insert(id.clone(), snapshot(&id, spec, "deployment-1".to_string()));
        self.submit("create_app", secrets);
        Ok(id)
    }

    async fn update_app(
        &self,
        id: &str,
        spec: &ServiceSpec,
        secrets: &StagedSecrets,
    ) -> Result<(), DeployError> {
        self.apps
            .lock()
            .unwrap()
            .insert(id.to_string(), snapshot(id, spec, "deployment-2".to_string()));
        self.submit("update_app", secrets);
        Ok(())
    }

    async fn set_image(&self, id: &str, image: &str) -> Result<(), DeployError> {
        if let Some(app) = self.apps.lock().unwrap().get_mut(id) {
            app.image = Some(image.to_string());
        }
        Ok(())
    }

    async fn delete_app(&self, id: &str) -> Result<bool, DeployError> {
        Ok(self.apps.lock().unwrap().remove(id).is_some())
    }

    async fn registry_name(&self) -> Result<Option<String>, DeployError> {
        Ok(self.registry.lock().unwrap().clone())
    }

    async fn ensure_registry(&self, name: &str) -> Result<(), DeployError> {
        *self.registry.lock().unwrap() = Some(name.to_string());
        Ok(())
    }
}

fn app_platform() -> (AppPlatformDriver, Arc<FakeAppPlatform>) {
    let api = Arc::new(FakeAppPlatform::default());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let driver = AppPlatformDriver::new(DriverConfig::new("nyc3", None), api.clone(), clock);
    (driver, api)
}

#[tokio::test]
async fn test_app_platform_stages_secrets_into_app_spec() {
    let (driver, api) = app_platform();
    let mut desired = create_desired(Platform::DoAppPlatform, "registry.digitalocean.com/acme/foo:v1");
    desired.secrets.push(DesiredSecret::generated(
        GeneratedSecret::ApiKey,
        Some(SecretString::from("a".repeat(40))),
    ));

    let plan = driver.plan(&desired, None).await.unwrap();
    let result = driver.up(&plan).await;

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.service_id.as_deref(), Some("app-foo-prod"));
    let submissions = api.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].0, "create_app");
    assert_eq!(
        submissions[0].1.get("foo-prod-database-url").map(String::as_str),
        Some("postgres://u:pw@db/foo")
    );
    assert_eq!(
        submissions[0].1.get("foo-prod-api-key").map(String::as_str),
        Some("a".repeat(40).as_str())
    );
    // values are submitted once; the URL update keeps the encrypted ones
    assert_eq!(submissions[1].0, "update_app");
    assert!(submissions[1].1.is_empty());
    let live = api.get_app("app-foo-prod").await.unwrap().unwrap();
    assert_eq!(
        live.secret_keys,
        vec!["API_KEY".to_string(), "DATABASE_URL".to_string()]
    );
}

#[tokio::test]
async fn test_app_platform_plans_registry_for_managed_images() {
    let (driver, api) = app_platform();
    let mut desired = create_desired(Platform::DoAppPlatform, "registry.digitalocean.com/foo/foo:abc");
    desired.managed_image = true;

    let plan = driver.plan(&desired, None).await.unwrap();
    let registry = plan.registry_action().unwrap();
    assert_eq!(registry.resource_type, ResourceType::RegistryRepo);
    assert_eq!(registry.action, ActionType::Create);

    assert!(driver.up(&plan).await.success);
    assert_eq!(api.registry_name().await.unwrap().as_deref(), Some("foo"));

    let plan = driver.plan(&desired, None).await.unwrap();
    assert_eq!(plan.registry_action().unwrap().action, ActionType::Noop);
}

#[tokio::test]
async fn test_app_platform_down_removes_app() {
    let (driver, api) = app_platform();
    let desired = create_desired(Platform::DoAppPlatform, "registry.digitalocean.com/acme/foo:v1");
    let plan = driver.plan(&desired, None).await.unwrap();
    assert!(driver.up(&plan).await.success);

    let state = recorded_state(Platform::DoAppPlatform, None);
    let result = driver.down(&state).await;

    assert!(result.success);
    assert!(api.find_app("foo-prod").await.unwrap().is_none());
    assert!(driver.down(&state).await.success);
}

#[tokio::test]
async fn test_app_platform_rollback_reapplies_recorded_spec() {
    let (driver, api) = app_platform();
    let mut broken = create_desired(Platform::DoAppPlatform, "registry.digitalocean.com/acme/foo:bad");
    broken.env.insert("FEATURE".to_string(), "broken".to_string());
    broken.port = 9000;
    let plan = driver.plan(&broken, None).await.unwrap();
    assert!(driver.up(&plan).await.success);
    let submitted = api.submissions().len();

    let result = driver.rollback(&recorded_config(Platform::DoAppPlatform)).await;

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.status, DeploymentStatus::RolledBack);
    let submissions = api.submissions();
    assert_eq!(submissions.len(), submitted + 1);
    // secret values stay in the app spec, nothing is re-staged
    assert_eq!(submissions[submitted].0, "update_app");
    assert!(submissions[submitted].1.is_empty());
    let live = api.get_app("app-foo-prod").await.unwrap().unwrap();
    assert_eq!(live.image.as_deref(), Some("registry.example.com/foo:good"));
    assert_eq!(live.port, Some(8080));
    assert!(live.env.get("FEATURE").is_none());
    assert_eq!(live.secret_keys, vec!["DATABASE_URL".to_string()]);
}
