//! Secret store adapter contract.
//!
//! Drivers push secret values through a [`SecretStore`] and embed only the returned
//! references in service payloads. Values are held as [`SecretString`] and are
//! scrubbed from any provider output by a [`Redactor`] before it is logged or returned.

use std::fmt;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::errors::DeployError;
use crate::models::StateKey;
use crate::utils::{generate_api_key, generate_rsa_private_key, to_kebab};

/// Placeholder written wherever a secret value would appear
pub const REDACTED: &str = "***";

/// Provider-side secret operations for one platform
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Create the secret or add a new version. Returns the reference to embed in
    /// the service definition.
    async fn upsert(&self, name: &str, value: &SecretString) -> Result<String, DeployError>;

    /// Reference of an existing secret, without touching its value.
    async fn reference(&self, name: &str) -> Result<String, DeployError>;

    /// Delete the secret. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, DeployError>;
}

/// Secrets this tool generates and therefore owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedSecret {
    ApiKey,
    RsaKey,
}

impl GeneratedSecret {
    pub fn env_key(&self) -> &'static str {
        match self {
            GeneratedSecret::ApiKey => "API_KEY",
            GeneratedSecret::RsaKey => "RSA_PRIVATE_KEY",
        }
    }

    fn name_suffix(&self) -> &'static str {
        match self {
            GeneratedSecret::ApiKey => "api-key",
            GeneratedSecret::RsaKey => "rsa-key",
        }
    }

    /// Fresh random value
    pub fn generate(&self) -> Result<SecretString, DeployError> {
        let value = match self {
            GeneratedSecret::ApiKey => generate_api_key(),
            GeneratedSecret::RsaKey => generate_rsa_private_key()?,
        };
        Ok(SecretString::from(value))
    }
}

impl fmt::Display for GeneratedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name_suffix())
    }
}

/// A secret the operator wants exposed to the service as an env var
#[derive(Debug, Clone)]
pub struct DesiredSecret {
    pub env_key: String,
    /// `None` for an already-recorded generated secret that is reused as-is
    pub value: Option<SecretString>,
    pub generated: Option<GeneratedSecret>,
}

impl DesiredSecret {
    pub fn user(env_key: impl Into<String>, value: SecretString) -> Self {
        Self {
            env_key: env_key.into(),
            value: Some(value),
            generated: None,
        }
    }

    pub fn generated(kind: GeneratedSecret, value: Option<SecretString>) -> Self {
        Self {
            env_key: kind.env_key().to_string(),
            value,
            generated: Some(kind),
        }
    }

    /// Provider-side name, scoped to one (service, environment)
    pub fn secret_name(&self, key: &StateKey) -> String {
        let suffix = match self.generated {
            Some(kind) => kind.name_suffix().to_string(),
            None => to_kebab(&self.env_key),
        };
        format!("{}-{}", key.provider_service_name(), suffix)
    }
}

/// Provider-side names of the secrets this tool owns for `key`
pub fn owned_secret_names(key: &StateKey, api_key: bool, rsa_key: bool) -> Vec<String> {
    let mut names = Vec::new();
    if api_key {
        names.push(DesiredSecret::generated(GeneratedSecret::ApiKey, None).secret_name(key));
    }
    if rsa_key {
        names.push(DesiredSecret::generated(GeneratedSecret::RsaKey, None).secret_name(key));
    }
    names
}

/// Scrubs known secret values out of free-form text
#[derive(Clone, Default)]
pub struct Redactor {
    needles: Vec<SecretString>,
}

impl fmt::Debug for Redactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redactor")
            .field("values", &self.needles.len())
            .finish()
    }
}

impl Redactor {
    pub fn new<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a SecretString>,
    {
        let mut needles: Vec<SecretString> = Vec::new();
        for value in values {
            let raw = value.expose_secret();
            if raw.is_empty() {
                continue;
            }
            needles.push(value.clone());
            // Multi-line values such as PEM keys may be echoed line by line.
            if raw.contains('\n') {
                needles.extend(
                    raw.lines()
                        .map(str::trim)
                        .filter(|line| line.len() >= 16)
                        .map(|line| SecretString::from(line.to_string())),
                );
            }
        }
        // Longest first so a value is never partially replaced by a shorter one.
        needles.sort_by_key(|n| std::cmp::Reverse(n.expose_secret().len()));
        Self { needles }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for needle in &self.needles {
            let raw = needle.expose_secret();
            if out.contains(raw) {
                out = out.replace(raw, REDACTED);
            }
        }
        out
    }
}
