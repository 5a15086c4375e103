//! Outcome of a driver operation

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::models::state::{DeploymentStatus, HealthStatus};

/// Result of `up`, `down`, `status` or `rollback`. Failures are values, not errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeploymentResult {
    pub success: bool,
    pub service_url: Option<String>,
    pub service_id: Option<String>,
    pub revision: Option<String>,
    pub image_digest: Option<String>,
    pub status: DeploymentStatus,
    pub health_status: HealthStatus,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub error_details: BTreeMap<String, String>,
}

fn serialize_secs<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(d.as_secs_f64())
}

impl DeploymentResult {
    pub fn success(status: DeploymentStatus) -> Self {
        Self {
            success: true,
            status,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: DeploymentStatus::Failed,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.error_details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Error message or an empty string
    pub fn message(&self) -> &str {
        self.error_message.as_deref().unwrap_or_default()
    }
}
