//! Deployment state store
//!
//! One JSON file per (service, environment, platform) under `.deployment/state/`.
//! Files are schema-versioned; older versions are migrated on load, newer ones are
//! refused. Writers hold [`FileStateStore::lock`] across load-modify-save.

use std::path::Path;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::{DeploymentState, StateKey, CURRENT_SCHEMA_VERSION};

/// File-backed store of [`DeploymentState`] records
#[derive(Debug)]
pub struct FileStateStore {
    dir: Dir,
    lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(dir: Dir) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    /// Serialize read-modify-write sequences within this process.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    fn file(&self, key: &StateKey) -> File {
        self.dir.file(&key.file_name())
    }

    /// Load the record for `key`, migrating older schemas.
    pub async fn load(&self, key: &StateKey) -> Result<Option<DeploymentState>, DeployError> {
        let file = self.file(key);
        let Some(contents) = file.read_string_opt().await? else {
            debug!(key = %key, "No deployment state");
            return Ok(None);
        };

        let state = parse_state(&contents, file.path())?;
        if state.key() != *key {
            return Err(DeployError::StateCorrupted {
                path: file.path().to_path_buf(),
                reason: format!("record belongs to {}, expected {}", state.key(), key),
            });
        }
        Ok(Some(state))
    }

    /// Persist `state` atomically.
    pub async fn save(&self, state: &DeploymentState) -> Result<(), DeployError> {
        state
            .validate()
            .map_err(|reason| DeployError::InvalidInput(format!("refusing to save state: {}", reason)))?;

        let mut record = state.clone();
        record.version = CURRENT_SCHEMA_VERSION;
        let file = self.file(&record.key());
        file.write_json(&record).await?;
        debug!(key = %record.key(), status = %record.status, "Saved deployment state");
        Ok(())
    }

    /// Remove the record. Returns whether one existed.
    pub async fn delete(&self, key: &StateKey) -> Result<bool, DeployError> {
        let existed = self.file(key).delete().await?;
        if existed {
            info!(key = %key, "Deleted deployment state");
        }
        Ok(existed)
    }

    /// All state files, for housekeeping
    pub async fn list_files(&self) -> Result<Vec<File>, DeployError> {
        Ok(self
            .dir
            .list_files()
            .await?
            .into_iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .map(File::new)
            .collect())
    }
}

fn corrupted(path: &Path, reason: impl Into<String>) -> DeployError {
    DeployError::StateCorrupted {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Parse a stored record, applying schema migrations.
pub fn parse_state(contents: &str, path: &Path) -> Result<DeploymentState, DeployError> {
    let value: Value =
        serde_json::from_str(contents).map_err(|e| corrupted(path, format!("invalid JSON: {}", e)))?;
    let Value::Object(mut object) = value else {
        return Err(corrupted(path, "top-level value is not an object"));
    };

    let version = match object.get("version") {
        None => 1,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| corrupted(path, "version is not a non-negative integer"))?,
    };

    if version > CURRENT_SCHEMA_VERSION {
        return Err(DeployError::UnsupportedStateVersion {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if version == 0 {
        return Err(corrupted(path, "version 0 is not a valid schema"));
    }

    if version < 2 {
        migrate_v1_to_v2(&mut object);
        info!(path = %path.display(), "Migrated deployment state from schema v1 to v2");
    }

    let state: DeploymentState = serde_json::from_value(Value::Object(object))
        .map_err(|e| corrupted(path, e.to_string()))?;
    state.validate().map_err(|reason| corrupted(path, reason))?;
    Ok(state)
}

/// v1 records predate the ownership flags and the provider metadata bag.
fn migrate_v1_to_v2(object: &mut Map<String, Value>) {
    object
        .entry("api_key_generated")
        .or_insert(Value::Bool(false));
    object
        .entry("rsa_key_generated")
        .or_insert(Value::Bool(false));
    object
        .entry("provider_data")
        .or_insert_with(|| Value::Object(Map::new()));

    let now = Value::String(Utc::now().to_rfc3339());
    object.entry("created_at").or_insert_with(|| now.clone());
    object.entry("updated_at").or_insert(now);

    object.insert("version".to_string(), Value::from(2u32));
}
