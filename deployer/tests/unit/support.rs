//! In-memory provider, secret store and probe used across the unit tests

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use agent_deployer::deploy::reconciler::UpReport;
use agent_deployer::deploy::{Reconciler, Target, UpOptions};
use agent_deployer::drivers::app_runner::{AppRunnerApi, AppRunnerDriver};
use agent_deployer::drivers::{DriverConfig, ServicePhase, ServiceSnapshot, ServiceSpec};
use agent_deployer::errors::DeployError;
use agent_deployer::filesys::dir::Dir;
use agent_deployer::health::{
    Clock, HealthCheckConfig, HealthVerifier, ManualClock, Probe, ProbeOutcome,
};
use agent_deployer::models::{DesiredService, Environment, Platform, StateKey};
use agent_deployer::secrets::{DesiredSecret, SecretStore};
use agent_deployer::storage::state_store::FileStateStore;
use agent_deployer::utils::BackoffOptions;

pub const REGION: &str = "us-east-1";

// ================================ SECRETS ================================= //

#[derive(Default)]
struct SecretsInner {
    values: BTreeMap<String, String>,
    upserts: Vec<String>,
    deletes: Vec<String>,
}

/// Secret store that keeps values in memory and logs every mutation
#[derive(Default)]
pub struct FakeSecrets {
    inner: Mutex<SecretsInner>,
}

impl FakeSecrets {
    pub fn insert(&self, name: &str, value: &str) {
        self.inner
            .lock()
            .unwrap()
            .values
            .insert(name.to_string(), value.to_string());
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().values.keys().cloned().collect()
    }

    pub fn value(&self, name: &str) -> Option<String> {
        self.inner.lock().unwrap().values.get(name).cloned()
    }

    pub fn upserts(&self) -> Vec<String> {
        self.inner.lock().unwrap().upserts.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.inner.lock().unwrap().deletes.clone()
    }
}

#[async_trait]
impl SecretStore for FakeSecrets {
    async fn upsert(&self, name: &str, value: &SecretString) -> Result<String, DeployError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .values
            .insert(name.to_string(), value.expose_secret().to_string());
        inner.upserts.push(name.to_string());
        Ok(format!("secret-ref/{}", name))
    }

    async fn reference(&self, name: &str) -> Result<String, DeployError> {
        if self.inner.lock().unwrap().values.contains_key(name) {
            Ok(format!("secret-ref/{}", name))
        } else {
            Err(DeployError::provider("fake", format!("secret {} not found", name)))
        }
    }

    async fn delete(&self, name: &str) -> Result<bool, DeployError> {
        let mut inner = self.inner.lock().unwrap();
        inner.deletes.push(name.to_string());
        Ok(inner.values.remove(name).is_some())
    }
}

// ============================== APP RUNNER ================================ //

#[derive(Default)]
struct AppRunnerInner {
    services: BTreeMap<String, ServiceSnapshot>,
    repositories: Vec<String>,
    mutations: Vec<String>,
    reject_next: Option<String>,
    operations: u32,
}

/// App Runner stand-in. Services become ready immediately.
#[derive(Default)]
pub struct FakeAppRunner {
    inner: Mutex<AppRunnerInner>,
}

pub fn arn_for(name: &str) -> String {
    format!("arn:aws:apprunner:{}:123456789012:service/{}/0001", REGION, name)
}

pub fn url_for(name: &str) -> String {
    format!("https://{}.{}.awsapprunner.com", name, REGION)
}

impl FakeAppRunner {
    pub fn mutations(&self) -> Vec<String> {
        self.inner.lock().unwrap().mutations.clone()
    }

    pub fn service(&self, name: &str) -> Option<ServiceSnapshot> {
        self.inner
            .lock()
            .unwrap()
            .services
            .values()
            .find(|s| s.name == name)
            .cloned()
    }

    /// Fail the next create or update with `message`
    pub fn reject_next(&self, message: &str) {
        self.inner.lock().unwrap().reject_next = Some(message.to_string());
    }

    fn snapshot(arn: &str, spec: &ServiceSpec, operation: u32) -> ServiceSnapshot {
        ServiceSnapshot {
            id: arn.to_string(),
            name: spec.name.clone(),
            url: Some(url_for(&spec.name)),
            revision: Some(format!("operation-{}", operation)),
            image: Some(spec.image.clone()),
            image_digest: None,
            phase: ServicePhase::Ready,
            env: spec.env.clone(),
            secret_keys: spec.secrets.keys().cloned().collect(),
            port: Some(spec.port),
        }
    }
}

#[async_trait]
impl AppRunnerApi for FakeAppRunner {
    async fn check_access(&self) -> Vec<String> {
        Vec::new()
    }

    async fn find_service(&self, name: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        Ok(self.service(name))
    }

    async fn describe_service(&self, arn: &str) -> Result<Option<ServiceSnapshot>, DeployError> {
        Ok(self.inner.lock().unwrap().services.get(arn).cloned())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, DeployError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.reject_next.take() {
            return Err(DeployError::provider("aws-app-runner", message));
        }
        inner.operations += 1;
        let arn = arn_for(&spec.name);
        let snapshot = Self::snapshot(&arn, spec, inner.operations);
        inner.services.insert(arn.clone(), snapshot);
        inner.mutations.push(format!("create_service:{}", spec.name));
        Ok(arn)
    }

    async fn update_service(&self, arn: &str, spec: &ServiceSpec) -> Result<(), DeployError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.reject_next.take() {
            return Err(DeployError::provider("aws-app-runner", message));
        }
        inner.operations += 1;
        let snapshot = Self::snapshot(arn, spec, inner.operations);
        inner.services.insert(arn.to_string(), snapshot);
        inner.mutations.push(format!("update_service:{}", spec.name));
        Ok(())
    }

    async fn set_image(&self, arn: &str, image: &str) -> Result<(), DeployError> {
        let mut inner = self.inner.lock().unwrap();
        inner.operations += 1;
        let operation = inner.operations;
        if let Some(service) = inner.services.get_mut(arn) {
            service.image = Some(image.to_string());
            service.revision = Some(format!("operation-{}", operation));
        }
        inner.mutations.push(format!("set_image:{}", image));
        Ok(())
    }

    async fn delete_service(&self, arn: &str) -> Result<bool, DeployError> {
        let mut inner = self.inner.lock().unwrap();
        inner.mutations.push(format!("delete_service:{}", arn));
        Ok(inner.services.remove(arn).is_some())
    }

    async fn repository_uri(&self, name: &str) -> Result<String, DeployError> {
        Ok(format!("123456789012.dkr.ecr.{}.amazonaws.com/{}", REGION, name))
    }

    async fn repository_exists(&self, name: &str) -> Result<bool, DeployError> {
        Ok(self.inner.lock().unwrap().repositories.iter().any(|r| r == name))
    }

    async fn ensure_repository(&self, name: &str) -> Result<(), DeployError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.repositories.iter().any(|r| r == name) {
            inner.repositories.push(name.to_string());
            inner.mutations.push(format!("create_repository:{}", name));
        }
        Ok(())
    }
}

// ================================= PROBE ================================== //

/// Answers with scripted status codes, then a fallback code
pub struct ScriptedProbe {
    script: Mutex<VecDeque<u16>>,
    fallback: Mutex<u16>,
    calls: Mutex<Vec<String>>,
    hang: AtomicBool,
}

impl ScriptedProbe {
    /// Never answers
    pub fn hanging() -> Self {
        let probe = Self::always(200);
        probe.set_hanging(true);
        probe
    }

    pub fn always(code: u16) -> Self {
        Self::sequence(Vec::new(), code)
    }

    pub fn sequence(codes: Vec<u16>, fallback: u16) -> Self {
        Self {
            script: Mutex::new(codes.into()),
            fallback: Mutex::new(fallback),
            calls: Mutex::new(Vec::new()),
            hang: AtomicBool::new(false),
        }
    }

    /// Stop answering (or resume)
    pub fn set_hanging(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_fallback(&self, code: u16) {
        *self.fallback.lock().unwrap() = code;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, url: &str, _timeout: Duration) -> ProbeOutcome {
        self.calls.lock().unwrap().push(url.to_string());
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let code = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.fallback.lock().unwrap());
        ProbeOutcome {
            status_code: Some(code),
            response_time: Duration::from_millis(5),
            error: if (200..300).contains(&code) {
                None
            } else {
                Some(format!("HTTP {}", code))
            },
        }
    }
}

/// Probe that also advances the clock, like a slow endpoint would
pub struct SlowProbe {
    pub clock: Arc<ManualClock>,
    pub latency: Duration,
    pub code: u16,
}

#[async_trait]
impl Probe for SlowProbe {
    async fn probe(&self, _url: &str, timeout: Duration) -> ProbeOutcome {
        let spent = self.latency.min(timeout);
        self.clock.advance(spent);
        ProbeOutcome {
            status_code: if spent < self.latency { None } else { Some(self.code) },
            response_time: spent,
            error: Some("slow".to_string()),
        }
    }
}

// ================================ HARNESS ================================= //

/// max_retries=3, base 1s, x2, cap 30s, one endpoint
pub fn health_config() -> HealthCheckConfig {
    HealthCheckConfig {
        timeout: Duration::from_secs(60),
        max_retries: 3,
        backoff: BackoffOptions {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        },
        success_threshold: 1,
        endpoints: vec!["/.well-known/health".to_string()],
        request_timeout: Duration::from_secs(10),
    }
}

/// Reconciler over the App Runner driver wired to fakes, with state in a temp dir
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<FileStateStore>,
    pub api: Arc<FakeAppRunner>,
    pub secrets: Arc<FakeSecrets>,
    pub probe: Arc<ScriptedProbe>,
    pub clock: Arc<ManualClock>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_probe(ScriptedProbe::always(200))
    }

    pub fn with_probe(probe: ScriptedProbe) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(Dir::new(dir.path().join("state"))));
        let api = Arc::new(FakeAppRunner::default());
        let secrets = Arc::new(FakeSecrets::default());
        let probe = Arc::new(probe);
        let clock = Arc::new(ManualClock::new());

        let driver = AppRunnerDriver::new(
            DriverConfig::new(REGION, None),
            api.clone(),
            secrets.clone(),
            clock.clone() as Arc<dyn Clock>,
        );
        let verifier = HealthVerifier::new(health_config(), probe.clone(), clock.clone());
        let reconciler = Reconciler::new(store.clone(), Arc::new(driver), Arc::new(verifier));

        Self {
            dir,
            store,
            api,
            secrets,
            probe,
            clock,
            reconciler,
        }
    }

    /// Every later health request answers `code`
    pub fn respond_with(&self, code: u16) {
        self.probe.set_fallback(code);
    }

    /// Health requests stop answering until switched back
    pub fn stall_health(&self, stall: bool) {
        self.probe.set_hanging(stall);
    }

    pub fn key(&self) -> StateKey {
        StateKey::new("foo", Environment::Dev, Platform::AwsAppRunner)
    }

    pub fn target(&self) -> Target {
        Target {
            key: self.key(),
            region: REGION.to_string(),
            project_id: None,
        }
    }

    pub fn desired(&self, image: &str, digest: Option<&str>) -> DesiredService {
        DesiredService {
            service_name: "foo".to_string(),
            environment: Environment::Dev,
            platform: Platform::AwsAppRunner,
            region: REGION.to_string(),
            project_id: None,
            image: image.to_string(),
            image_digest: digest.map(str::to_string),
            managed_image: false,
            port: 8000,
            env: BTreeMap::from([
                ("SERVICE_ENVIRONMENT".to_string(), "dev".to_string()),
                ("LOG_LEVEL".to_string(), "INFO".to_string()),
            ]),
            secrets: Vec::new(),
            public_url_var: "SERVICE_PUBLIC_URL".to_string(),
            force: false,
        }
    }

    pub fn with_secret(mut desired: DesiredService, key: &str, value: &str) -> DesiredService {
        desired
            .secrets
            .push(DesiredSecret::user(key, SecretString::from(value.to_string())));
        desired
    }

    pub async fn up(&self, desired: &DesiredService) -> UpReport {
        self.up_with(desired, UpOptions::default()).await
    }

    pub async fn up_with(&self, desired: &DesiredService, options: UpOptions) -> UpReport {
        self.reconciler
            .up(desired, &options, |_| true)
            .await
            .unwrap()
    }
}
