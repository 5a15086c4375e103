//! Desired service input and the plan computed from it

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::models::state::{DeploymentStatus, Environment, Platform, StateKey};
use crate::secrets::{DesiredSecret, GeneratedSecret};
use crate::utils::digest_pairs;

use secrecy::SecretString;

/// Kind of resource an action touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    Service,
    Secret,
    RegistryRepo,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Service => "service",
            ResourceType::Secret => "secret",
            ResourceType::RegistryRepo => "registry-repo",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    Noop,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Create => "CREATE",
            ActionType::Update => "UPDATE",
            ActionType::Delete => "DELETE",
            ActionType::Noop => "NOOP",
        };
        f.write_str(s)
    }
}

/// One atomic unit of planned change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceAction {
    pub resource_type: ResourceType,
    pub action: ActionType,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ResourceAction {
    pub fn new(
        resource_type: ResourceType,
        action: ActionType,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            action,
            name: name.into(),
            description: description.into(),
            cost_estimate: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn is_noop(&self) -> bool {
        self.action == ActionType::Noop
    }
}

/// What the operator asks to have running
#[derive(Debug, Clone)]
pub struct DesiredService {
    pub service_name: String,
    pub environment: Environment,
    pub platform: Platform,
    pub region: String,
    pub project_id: Option<String>,
    /// Image reference to deploy
    pub image: String,
    /// Digest of `image`, known after a push
    pub image_digest: Option<String>,
    /// The image lives in the registry repository this tool manages
    pub managed_image: bool,
    pub port: u16,
    /// Plain environment variables, defaults included
    pub env: BTreeMap<String, String>,
    pub secrets: Vec<DesiredSecret>,
    /// Env var that receives the service's own public URL
    pub public_url_var: String,
    /// Re-apply even when nothing changed
    pub force: bool,
}

impl DesiredService {
    pub fn key(&self) -> StateKey {
        StateKey::new(self.service_name.clone(), self.environment, self.platform)
    }

    pub fn provider_service_name(&self) -> String {
        self.key().provider_service_name()
    }

    /// Digest of the plain env, excluding the injected public URL
    pub fn env_digest(&self) -> String {
        digest_pairs(
            self.env
                .iter()
                .filter(|(k, _)| **k != self.public_url_var)
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }

    pub fn secret_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.secrets.iter().map(|s| s.env_key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// A secret as it will be applied
#[derive(Debug, Clone, Serialize)]
pub struct PlannedSecret {
    pub env_key: String,
    /// Provider-side secret name
    pub secret_name: String,
    pub action: ActionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated: Option<GeneratedSecret>,
    /// Never serialized
    #[serde(skip)]
    pub value: Option<SecretString>,
}

/// Ephemeral projection of desired vs. current state
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    pub platform: Platform,
    pub service_name: String,
    pub environment: Environment,
    pub region: String,
    pub project_id: Option<String>,
    pub actions: Vec<ResourceAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,

    pub current_image: Option<String>,
    pub current_url: Option<String>,
    pub current_status: Option<DeploymentStatus>,
    /// Provider id of the live service, when one exists
    pub current_service_id: Option<String>,

    pub target_image: String,
    pub target_digest: Option<String>,
    pub target_port: u16,
    pub env_vars: BTreeMap<String, String>,
    pub secrets: Vec<PlannedSecret>,
    pub public_url_var: String,

    pub env_digest: String,
    pub secret_keys: Vec<String>,
}

impl DeploymentPlan {
    pub fn key(&self) -> StateKey {
        StateKey::new(self.service_name.clone(), self.environment, self.platform)
    }

    pub fn provider_service_name(&self) -> String {
        self.key().provider_service_name()
    }

    /// True when applying this plan must not touch the provider
    pub fn is_noop(&self) -> bool {
        self.actions.iter().all(ResourceAction::is_noop)
    }

    pub fn service_action(&self) -> Option<&ResourceAction> {
        self.actions
            .iter()
            .find(|a| a.resource_type == ResourceType::Service)
    }

    pub fn registry_action(&self) -> Option<&ResourceAction> {
        self.actions
            .iter()
            .find(|a| a.resource_type == ResourceType::RegistryRepo)
    }

    /// Secrets whose values must be pushed to the provider
    pub fn secrets_to_upsert(&self) -> impl Iterator<Item = &PlannedSecret> {
        self.secrets
            .iter()
            .filter(|s| s.action != ActionType::Noop && s.value.is_some())
    }

    pub fn generated(&self, kind: GeneratedSecret) -> bool {
        self.secrets.iter().any(|s| s.generated == Some(kind))
    }

    /// Counts per action type, for summaries
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for action in &self.actions {
            *counts.entry(action.action.to_string()).or_insert(0) += 1;
        }
        counts
    }
}
