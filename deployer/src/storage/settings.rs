//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::models::Platform;
use crate::utils::BackoffOptions;

/// Deployer settings, read from `.deployment/settings.json` when present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// JSON log lines on stderr
    #[serde(default)]
    pub json_logs: bool,

    /// Also write rolling log files into `.deployment/logs/`
    #[serde(default = "default_true")]
    pub file_logging: bool,

    #[serde(default)]
    pub regions: RegionSettings,

    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Overall bound on `up`, in seconds
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,

    /// Interval between provider readiness polls, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_public_url_var")]
    pub public_url_var: String,

    #[serde(default)]
    pub health: HealthSettings,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8000
}

fn default_deploy_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    5
}

fn default_public_url_var() -> String {
    "SERVICE_PUBLIC_URL".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            file_logging: true,
            regions: RegionSettings::default(),
            default_port: default_port(),
            deploy_timeout_secs: default_deploy_timeout(),
            poll_interval_secs: default_poll_interval(),
            public_url_var: default_public_url_var(),
            health: HealthSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file is missing.
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        match file.read_json_opt::<Settings>().await {
            Ok(Some(settings)) => {
                debug!("Loaded settings from {}", file.path().display());
                Ok(settings)
            }
            Ok(None) => Ok(Settings::default()),
            Err(DeployError::JsonError(e)) => Err(DeployError::ConfigError(format!(
                "{}: {}",
                file.path().display(),
                e
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn region_for(&self, platform: Platform) -> &str {
        match platform {
            Platform::CloudRun => &self.regions.cloud_run,
            Platform::AwsAppRunner => &self.regions.aws_app_runner,
            Platform::DoAppPlatform => &self.regions.do_app_platform,
        }
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Default region per platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSettings {
    #[serde(default = "default_cloud_run_region")]
    pub cloud_run: String,
    #[serde(default = "default_app_runner_region")]
    pub aws_app_runner: String,
    #[serde(default = "default_app_platform_region")]
    pub do_app_platform: String,
}

fn default_cloud_run_region() -> String {
    Platform::CloudRun.default_region().to_string()
}

fn default_app_runner_region() -> String {
    Platform::AwsAppRunner.default_region().to_string()
}

fn default_app_platform_region() -> String {
    Platform::DoAppPlatform.default_region().to_string()
}

impl Default for RegionSettings {
    fn default() -> Self {
        Self {
            cloud_run: default_cloud_run_region(),
            aws_app_runner: default_app_runner_region(),
            do_app_platform: default_app_platform_region(),
        }
    }
}

/// Health verification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_health_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    30.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_success_threshold() -> u32 {
    1
}

fn default_endpoints() -> Vec<String> {
    vec!["/.well-known/health".to_string()]
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_health_timeout(),
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            backoff_multiplier: default_multiplier(),
            success_threshold: default_success_threshold(),
            endpoints: default_endpoints(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl HealthSettings {
    pub fn backoff(&self) -> BackoffOptions {
        BackoffOptions {
            base_delay: Duration::from_secs_f64(self.base_delay_secs.max(0.0)),
            max_delay: Duration::from_secs_f64(self.max_delay_secs.max(0.0)),
            multiplier: self.backoff_multiplier,
        }
    }
}
