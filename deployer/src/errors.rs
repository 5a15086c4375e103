//! Error types for the deployment orchestrator

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the deployment orchestrator
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Missing credentials, missing CLI, unreachable provider API.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Malformed desired service definition or CLI input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{platform} provider error: {message}")]
    Provider { platform: String, message: String },

    #[error("State file {path} is corrupted: {reason}")]
    StateCorrupted { path: PathBuf, reason: String },

    #[error("State file uses schema version {found}, newest supported is {supported}")]
    UnsupportedStateVersion { found: u32, supported: u32 },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn provider(platform: impl Into<String>, message: impl Into<String>) -> Self {
        DeployError::Provider {
            platform: platform.into(),
            message: message.into(),
        }
    }

    /// State problems the operator has to resolve by hand. Never auto-repaired.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeployError::StateCorrupted { .. } | DeployError::UnsupportedStateVersion { .. }
        )
    }

    /// Whether retrying the same command might succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DeployError::Provider { .. } | DeployError::HttpError(_) | DeployError::Timeout(_)
        )
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}
