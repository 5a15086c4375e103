//! State store unit tests

use std::collections::BTreeMap;

use chrono::Utc;

use agent_deployer::errors::DeployError;
use agent_deployer::filesys::dir::Dir;
use agent_deployer::models::{
    DeploymentState, DeploymentStatus, Environment, HealthStatus, Platform, StateKey,
};
use agent_deployer::storage::state_store::FileStateStore;

fn create_test_state(name: &str, platform: Platform) -> DeploymentState {
    let mut state = DeploymentState {
        version: 2,
        service_name: name.to_string(),
        platform,
        environment: Environment::Staging,
        region: platform.default_region().to_string(),
        project_id: None,
        image_tag: format!("registry.example.com/{}:v1", name),
        image_digest: Some("sha256:abc".to_string()),
        service_url: Some(format!("https://{}.example.com", name)),
        revision: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        status: DeploymentStatus::Running,
        health_status: HealthStatus::Healthy,
        port: 8000,
        api_key_generated: true,
        rsa_key_generated: false,
        provider_data: BTreeMap::new(),
    };
    state.set_provider_value("env_digest", "d1");
    state.set_provider_value("secret_keys", vec!["API_KEY".to_string()]);
    state
}

fn store() -> (tempfile::TempDir, FileStateStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStateStore::new(Dir::new(dir.path().join("state")));
    (dir, store)
}

#[tokio::test]
async fn test_save_and_load() {
    let (_dir, store) = store();
    let state = create_test_state("foo", Platform::DoAppPlatform);

    tokio_test::assert_ok!(store.save(&state).await);
    let loaded = store.load(&state.key()).await.unwrap().unwrap();

    assert_eq!(loaded, state);
    assert_eq!(loaded.env_digest(), Some("d1"));
    assert_eq!(loaded.secret_keys(), vec!["API_KEY".to_string()]);
    assert!(store
        .dir()
        .path()
        .join("foo-staging-do-app-platform.json")
        .exists());
}

#[tokio::test]
async fn test_missing_record_is_none() {
    let (_dir, store) = store();
    let key = StateKey::new("nothing", Environment::Dev, Platform::CloudRun);
    assert!(store.load(&key).await.unwrap().is_none());
    assert!(!store.delete(&key).await.unwrap());
}

#[tokio::test]
async fn test_records_are_keyed_per_platform() {
    let (_dir, store) = store();
    store.save(&create_test_state("foo", Platform::CloudRun)).await.unwrap();
    store.save(&create_test_state("foo", Platform::AwsAppRunner)).await.unwrap();

    assert_eq!(store.list_files().await.unwrap().len(), 2);

    let key = StateKey::new("foo", Environment::Staging, Platform::CloudRun);
    assert!(store.delete(&key).await.unwrap());
    assert!(store.load(&key).await.unwrap().is_none());
    let other = StateKey::new("foo", Environment::Staging, Platform::AwsAppRunner);
    assert!(store.load(&other).await.unwrap().is_some());
    assert_eq!(store.list_files().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_misfiled_record_is_corrupted() {
    let (_dir, store) = store();
    let state = create_test_state("foo", Platform::CloudRun);
    store.save(&state).await.unwrap();

    // a record copied under another key's file name
    let key = StateKey::new("bar", Environment::Staging, Platform::CloudRun);
    let from = store.dir().path().join(state.key().file_name());
    std::fs::copy(&from, store.dir().path().join(key.file_name())).unwrap();

    let err = store.load(&key).await.unwrap_err();
    assert!(matches!(err, DeployError::StateCorrupted { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_future_schema_is_refused_and_left_alone() {
    let (_dir, store) = store();
    let state = create_test_state("foo", Platform::CloudRun);
    store.save(&state).await.unwrap();

    let path = store.dir().path().join(state.key().file_name());
    let mut record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    record["version"] = serde_json::Value::from(9);
    let contents = record.to_string();
    std::fs::write(&path, &contents).unwrap();

    let err = store.load(&state.key()).await.unwrap_err();
    assert!(matches!(
        err,
        DeployError::UnsupportedStateVersion { found: 9, .. }
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), contents);
}

#[tokio::test]
async fn test_invalid_state_is_not_saved() {
    let (_dir, store) = store();
    let mut state = create_test_state("foo", Platform::CloudRun);
    state.image_tag = String::new();

    let err = store.save(&state).await.unwrap_err();
    assert!(matches!(err, DeployError::InvalidInput(_)));
    assert!(store.list_files().await.unwrap().is_empty());
}
