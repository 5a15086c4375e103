//! Deployment state models

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Newest state file schema this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Keys in [`DeploymentState::provider_data`] that drive config diffing.
pub mod provider_keys {
    pub const ENV_DIGEST: &str = "env_digest";
    pub const SECRET_KEYS: &str = "secret_keys";
    pub const IMAGE_REF: &str = "image_ref";
    pub const SERVICE_ID: &str = "service_id";
    /// Plain env as applied, public URL included
    pub const ENV_VARS: &str = "env_vars";
    /// Env key -> provider secret name
    pub const SECRET_NAMES: &str = "secret_names";
    /// [`super::HealthyRelease`] of the last verified deployment
    pub const LAST_HEALTHY: &str = "last_healthy";
}

/// Supported container hosting platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "cloud-run")]
    CloudRun,
    #[serde(rename = "aws-app-runner")]
    AwsAppRunner,
    #[serde(rename = "do-app-platform")]
    DoAppPlatform,
}

impl Platform {
    pub fn all() -> [Platform; 3] {
        [
            Platform::CloudRun,
            Platform::AwsAppRunner,
            Platform::DoAppPlatform,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::CloudRun => "cloud-run",
            Platform::AwsAppRunner => "aws-app-runner",
            Platform::DoAppPlatform => "do-app-platform",
        }
    }

    pub fn default_region(&self) -> &'static str {
        match self {
            Platform::CloudRun => "us-central1",
            Platform::AwsAppRunner => "us-east-1",
            Platform::DoAppPlatform => "nyc3",
        }
    }

    /// Whether this platform needs an explicit project id
    pub fn requires_project(&self) -> bool {
        matches!(self, Platform::CloudRun)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cloud-run" | "cloudrun" | "gcp" => Ok(Platform::CloudRun),
            "aws-app-runner" | "app-runner" | "aws" => Ok(Platform::AwsAppRunner),
            "do-app-platform" | "app-platform" | "digitalocean" | "do" => {
                Ok(Platform::DoAppPlatform)
            }
            other => Err(DeployError::InvalidInput(format!(
                "unsupported platform '{}', expected one of: cloud-run, aws-app-runner, do-app-platform",
                other
            ))),
        }
    }
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "staging" | "stage" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(DeployError::InvalidInput(format!(
                "unsupported environment '{}', expected dev, staging or prod",
                other
            ))),
        }
    }
}

/// Deployment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Unknown,
    Creating,
    Updating,
    Running,
    Failed,
    RolledBack,
    Deleting,
    Deleted,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Unknown => "unknown",
            DeploymentStatus::Creating => "creating",
            DeploymentStatus::Updating => "updating",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Deleting => "deleting",
            DeploymentStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Health of a deployed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Degraded,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Identity of one logical deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub service_name: String,
    pub environment: Environment,
    pub platform: Platform,
}

impl StateKey {
    pub fn new(service_name: impl Into<String>, environment: Environment, platform: Platform) -> Self {
        Self {
            service_name: service_name.into(),
            environment,
            platform,
        }
    }

    /// `{service}-{env}-{platform}.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.json",
            self.service_name, self.environment, self.platform
        )
    }

    /// Provider-side service name, `{service}-{env}`
    pub fn provider_service_name(&self) -> String {
        format!("{}-{}", self.service_name, self.environment)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service_name, self.environment, self.platform)
    }
}

/// The durable record of one logical deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub version: u32,
    pub service_name: String,
    pub platform: Platform,
    pub environment: Environment,
    pub region: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub image_tag: String,
    #[serde(default)]
    pub image_digest: Option<String>,
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default)]
    pub health_status: HealthStatus,
    pub port: u16,
    pub api_key_generated: bool,
    pub rsa_key_generated: bool,
    pub provider_data: BTreeMap<String, serde_json::Value>,
}

impl DeploymentState {
    pub fn key(&self) -> StateKey {
        StateKey::new(self.service_name.clone(), self.environment, self.platform)
    }

    /// Fields that serde cannot enforce
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.trim().is_empty() {
            return Err("service_name is empty".to_string());
        }
        if self.image_tag.trim().is_empty() {
            return Err("image_tag is empty".to_string());
        }
        if self.region.trim().is_empty() {
            return Err("region is empty".to_string());
        }
        if self.port == 0 {
            return Err("port is zero".to_string());
        }
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        self.health_status == HealthStatus::Healthy
    }

    fn provider_str(&self, key: &str) -> Option<&str> {
        self.provider_data.get(key).and_then(|v| v.as_str())
    }

    pub fn env_digest(&self) -> Option<&str> {
        self.provider_str(provider_keys::ENV_DIGEST)
    }

    pub fn image_ref(&self) -> Option<&str> {
        self.provider_str(provider_keys::IMAGE_REF)
    }

    pub fn service_id(&self) -> Option<&str> {
        self.provider_str(provider_keys::SERVICE_ID)
    }

    /// Sorted environment keys that were deployed as secrets
    pub fn secret_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .provider_data
            .get(provider_keys::SECRET_KEYS)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn set_provider_value(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.provider_data.insert(key.to_string(), value.into());
    }

    fn provider_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.provider_data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn set_or_remove<T: Serialize>(&mut self, key: &str, value: Option<&T>) {
        match value.and_then(|v| serde_json::to_value(v).ok()) {
            Some(value) => {
                self.provider_data.insert(key.to_string(), value);
            }
            None => {
                self.provider_data.remove(key);
            }
        }
    }

    /// Env as applied; `None` for records written before it was tracked
    pub fn env_vars(&self) -> Option<BTreeMap<String, String>> {
        self.provider_value(provider_keys::ENV_VARS)
    }

    pub fn secret_names(&self) -> BTreeMap<String, String> {
        self.provider_value(provider_keys::SECRET_NAMES)
            .unwrap_or_default()
    }

    /// What this record describes, as a release
    pub fn release(&self) -> HealthyRelease {
        HealthyRelease {
            image_tag: self.image_tag.clone(),
            image_digest: self.image_digest.clone(),
            revision: self.revision.clone(),
            service_url: self.service_url.clone(),
            port: self.port,
            image_ref: self.image_ref().map(str::to_string),
            env_digest: self.env_digest().map(str::to_string),
            env_vars: self.env_vars(),
            secret_keys: self.secret_keys(),
            secret_names: self.secret_names(),
        }
    }

    /// Remember the current release as the last one that passed verification.
    pub fn mark_healthy_release(&mut self) {
        let release = self.release();
        self.set_or_remove(provider_keys::LAST_HEALTHY, Some(&release));
    }

    /// Last release that passed verification. Records that predate the
    /// tracking count themselves when they are running and healthy.
    pub fn healthy_release(&self) -> Option<HealthyRelease> {
        match self.provider_data.get(provider_keys::LAST_HEALTHY) {
            Some(value) => serde_json::from_value(value.clone()).ok(),
            None if self.status == DeploymentStatus::Running && self.is_healthy() => {
                Some(self.release())
            }
            None => None,
        }
    }

    /// This record pointed back at `release`. Identity, ownership flags and
    /// the remembered healthy release are kept.
    pub fn restored(&self, release: &HealthyRelease) -> DeploymentState {
        let mut state = self.clone();
        state.image_tag = release.image_tag.clone();
        state.image_digest = release.image_digest.clone();
        state.revision = release.revision.clone();
        state.service_url = release.service_url.clone().or_else(|| self.service_url.clone());
        state.port = release.port;

        let image_ref = release.image_ref.clone().unwrap_or_else(|| release.image_tag.clone());
        state.set_provider_value(provider_keys::IMAGE_REF, image_ref);
        state.set_or_remove(provider_keys::ENV_DIGEST, release.env_digest.as_ref());
        state.set_or_remove(provider_keys::ENV_VARS, release.env_vars.as_ref());
        state.set_provider_value(provider_keys::SECRET_KEYS, release.secret_keys.clone());
        let names = Some(&release.secret_names).filter(|n| !n.is_empty());
        state.set_or_remove(provider_keys::SECRET_NAMES, names);
        state
    }
}

/// Everything needed to put a service back the way it was when it last
/// passed health verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthyRelease {
    pub image_tag: String,
    #[serde(default)]
    pub image_digest: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub service_url: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub env_digest: Option<String>,
    #[serde(default)]
    pub env_vars: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub secret_keys: Vec<String>,
    #[serde(default)]
    pub secret_names: BTreeMap<String, String>,
}
