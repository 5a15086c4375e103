//! Reconciliation engine tests against the in-memory App Runner

use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::SecretString;

use agent_deployer::deploy::{UpOptions, UpOutcome};
use agent_deployer::drivers::app_runner::AppRunnerApi;
use agent_deployer::drivers::ServiceSpec;
use agent_deployer::errors::DeployError;
use agent_deployer::models::{ActionType, DeploymentStatus, HealthStatus, ResourceType};
use agent_deployer::secrets::{DesiredSecret, GeneratedSecret};

use crate::support::{arn_for, url_for, Harness, ScriptedProbe};

const V1: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/foo:v1";
const V2: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/foo:v2";
const V3: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/foo:v3";

#[tokio::test]
async fn test_first_up_creates_service_and_secret() {
    let h = Harness::new();
    let desired = Harness::with_secret(h.desired(V1, Some("sha256:aaa")), "DB_PASSWORD", "s3cret");

    let plan = h.reconciler.plan(&desired).await.unwrap();
    let kinds: Vec<(ResourceType, ActionType)> =
        plan.actions.iter().map(|a| (a.resource_type, a.action)).collect();
    assert_eq!(
        kinds,
        vec![
            (ResourceType::Secret, ActionType::Create),
            (ResourceType::Service, ActionType::Create),
        ]
    );

    let report = h.up(&desired).await;

    assert_eq!(report.outcome, UpOutcome::Deployed);
    assert_eq!(h.secrets.upserts(), vec!["foo-dev-db-password".to_string()]);
    assert_eq!(h.secrets.value("foo-dev-db-password").as_deref(), Some("s3cret"));
    // second update injects the public URL
    assert_eq!(
        h.api.mutations(),
        vec!["create_service:foo-dev".to_string(), "update_service:foo-dev".to_string()]
    );
    let live = h.api.service("foo-dev").unwrap();
    assert_eq!(live.env.get("SERVICE_PUBLIC_URL"), Some(&url_for("foo-dev")));
    assert_eq!(live.secret_keys, vec!["DB_PASSWORD".to_string()]);

    let state = h.store.load(&h.key()).await.unwrap().unwrap();
    assert_eq!(state.status, DeploymentStatus::Running);
    assert_eq!(state.health_status, HealthStatus::Healthy);
    assert_eq!(state.image_tag, V1);
    assert_eq!(state.image_digest.as_deref(), Some("sha256:aaa"));
    assert_eq!(state.service_url, Some(url_for("foo-dev")));
    assert_eq!(state.service_id(), Some(arn_for("foo-dev").as_str()));
    assert_eq!(state.secret_keys(), vec!["DB_PASSWORD".to_string()]);
    assert!(!state.api_key_generated);
    assert_eq!(report.state, Some(state));
}

#[tokio::test]
async fn test_second_up_is_noop() {
    let h = Harness::new();
    let desired = Harness::with_secret(h.desired(V1, Some("sha256:aaa")), "DB_PASSWORD", "s3cret");
    h.up(&desired).await;
    let before = h.store.load(&h.key()).await.unwrap();
    let mutations = h.api.mutations().len();
    let probes = h.probe.calls().len();

    let report = h.up(&desired).await;

    assert_eq!(report.outcome, UpOutcome::UpToDate);
    assert!(report.plan.is_noop());
    assert!(report.result.is_none());
    assert_eq!(h.api.mutations().len(), mutations);
    assert_eq!(h.secrets.upserts().len(), 1);
    assert_eq!(h.probe.calls().len(), probes);
    assert_eq!(h.store.load(&h.key()).await.unwrap(), before);
}

#[tokio::test]
async fn test_changed_digest_updates() {
    let h = Harness::new();
    h.up(&h.desired(V1, Some("sha256:aaa"))).await;
    let created_at = h.store.load(&h.key()).await.unwrap().unwrap().created_at;

    let report = h.up(&h.desired(V1, Some("sha256:bbb"))).await;

    assert_eq!(report.outcome, UpOutcome::Deployed);
    let service = report.plan.service_action().unwrap();
    assert_eq!(service.action, ActionType::Update);
    assert!(service.description.contains("image digest"));
    // URL already known, so no extra update for it
    assert_eq!(h.api.mutations().last().unwrap(), "update_service:foo-dev");
    assert_eq!(h.api.mutations().len(), 3);

    let state = h.store.load(&h.key()).await.unwrap().unwrap();
    assert_eq!(state.image_digest.as_deref(), Some("sha256:bbb"));
    assert_eq!(state.created_at, created_at);
}

#[tokio::test]
async fn test_unhealthy_update_rolls_back() {
    let h = Harness::new();
    h.up(&h.desired(V1, Some("sha256:aaa"))).await;
    h.probe.set_fallback(503);

    let report = h.up(&h.desired(V2, Some("sha256:bbb"))).await;

    assert_eq!(report.outcome, UpOutcome::RolledBack);
    assert!(!report.succeeded());
    assert!(report.message.as_deref().unwrap().contains("health verification failed"));
    assert!(report.rollback.as_ref().unwrap().success);
    // the recorded configuration is re-applied, not just the image
    assert_eq!(h.api.mutations().last().unwrap(), "update_service:foo-dev");
    assert_eq!(h.api.service("foo-dev").unwrap().image.as_deref(), Some(V1));

    let state = h.store.load(&h.key()).await.unwrap().unwrap();
    assert_eq!(state.status, DeploymentStatus::RolledBack);
    assert_eq!(state.image_tag, V1);
    assert_eq!(state.image_digest.as_deref(), Some("sha256:aaa"));
    assert_eq!(state.service_url, Some(url_for("foo-dev")));
}

#[tokio::test]
async fn test_repeated_failures_keep_the_last_healthy_release() {
    let h = Harness::new();
    h.up(&h.desired(V1, Some("sha256:aaa"))).await;
    h.respond_with(503);

    let report = h.up(&h.desired(V2, Some("sha256:bbb"))).await;
    assert_eq!(report.outcome, UpOutcome::RolledBack);

    // a failing status check must not forget what was healthy
    let status = h.reconciler.status(&h.key()).await.unwrap();
    assert_eq!(status.state.health_status, HealthStatus::Unhealthy);

    let report = h.up(&h.desired(V3, Some("sha256:ccc"))).await;

    assert_eq!(report.outcome, UpOutcome::RolledBack);
    assert!(report.rollback.as_ref().unwrap().success);
    let live = h.api.service("foo-dev").unwrap();
    assert_eq!(live.image.as_deref(), Some(V1));
    let state = h.store.load(&h.key()).await.unwrap().unwrap();
    assert_eq!(state.status, DeploymentStatus::RolledBack);
    assert_eq!(state.image_tag, V1);
    assert_eq!(state.image_digest.as_deref(), Some("sha256:aaa"));
    assert!(h
        .api
        .mutations()
        .iter()
        .all(|m| !m.starts_with("delete_service")));
}

#[tokio::test]
async fn test_rollback_restores_previous_configuration() {
    let h = Harness::new();
    let good = Harness::with_secret(h.desired(V1, Some("sha256:aaa")), "DB_PASSWORD", "s3cret");
    h.up(&good).await;
    h.respond_with(503);

    let mut broken = Harness::with_secret(h.desired(V2, Some("sha256:bbb")), "DB_PASSWORD", "s3cret");
    broken.env.insert("FEATURE".to_string(), "broken".to_string());
    broken.port = 9000;
    broken.secrets.push(DesiredSecret::user(
        "EXTRA_TOKEN",
        SecretString::from("t0ken".to_string()),
    ));
    let report = h.up(&broken).await;
    assert_eq!(report.outcome, UpOutcome::RolledBack);

    let live = h.api.service("foo-dev").unwrap();
    assert_eq!(live.image.as_deref(), Some(V1));
    assert_eq!(live.port, Some(8000));
    assert!(live.env.get("FEATURE").is_none());
    assert_eq!(live.env.get("SERVICE_PUBLIC_URL"), Some(&url_for("foo-dev")));
    assert_eq!(live.secret_keys, vec!["DB_PASSWORD".to_string()]);

    // record and provider agree again
    h.respond_with(200);
    let plan = h.reconciler.plan(&good).await.unwrap();
    assert!(plan.is_noop(), "{:?}", plan.actions);
}

#[tokio::test]
async fn test_live_config_drift_is_planned() {
    let h = Harness::new();
    let desired = h.desired(V1, Some("sha256:aaa"));
    h.up(&desired).await;

    // someone edits the service by hand
    let live = h.api.service("foo-dev").unwrap();
    let mut env = live.env.clone();
    env.insert("FEATURE".to_string(), "manual".to_string());
    let spec = ServiceSpec {
        name: live.name.clone(),
        image: V1.to_string(),
        port: 8000,
        env,
        secrets: BTreeMap::new(),
    };
    h.api.update_service(&live.id, &spec).await.unwrap();

    let plan = h.reconciler.plan(&desired).await.unwrap();
    let service = plan.service_action().unwrap();
    assert_eq!(service.action, ActionType::Update);
    assert!(service.description.contains("drifted"));
}

#[tokio::test]
async fn test_unhealthy_first_deploy_is_removed() {
    let h = Harness::with_probe(ScriptedProbe::always(503));
    let desired = Harness::with_secret(h.desired(V1, None), "DB_PASSWORD", "s3cret");

    let report = h.up(&desired).await;

    assert_eq!(report.outcome, UpOutcome::Removed);
    assert!(report.state.is_none());
    assert!(h.store.load(&h.key()).await.unwrap().is_none());
    assert!(h.api.service("foo-dev").is_none());
    // user secrets outlive a failed first deploy
    assert_eq!(h.secrets.names(), vec!["foo-dev-db-password".to_string()]);
    assert!(h.secrets.deletes().is_empty());
}

#[tokio::test]
async fn test_rollback_disabled_records_failure() {
    let h = Harness::with_probe(ScriptedProbe::always(503));
    let options = UpOptions {
        rollback: false,
        ..Default::default()
    };

    let report = h.up_with(&h.desired(V1, None), options).await;

    assert_eq!(report.outcome, UpOutcome::Unhealthy);
    assert!(h.api.service("foo-dev").is_some());
    let state = h.store.load(&h.key()).await.unwrap().unwrap();
    assert_eq!(state.status, DeploymentStatus::Failed);
    assert_eq!(state.health_status, HealthStatus::Unhealthy);

    // the failed record forces a retry even with identical input
    h.probe.set_fallback(200);
    let report = h.up(&h.desired(V1, None)).await;
    assert_eq!(report.outcome, UpOutcome::Deployed);
    assert!(report
        .plan
        .service_action()
        .unwrap()
        .description
        .contains("last deployment failed"));
}

#[tokio::test]
async fn test_provider_rejection_keeps_previous_record() {
    let h = Harness::new();
    let desired = Harness::with_secret(h.desired(V1, Some("sha256:aaa")), "DB_PASSWORD", "s3cret");
    h.up(&desired).await;
    h.api.reject_next("invalid configuration near value s3cret");

    let mut changed = desired.clone();
    changed.image = V2.to_string();
    changed.image_digest = Some("sha256:bbb".to_string());
    let report = h.up(&changed).await;

    assert_eq!(report.outcome, UpOutcome::Rejected);
    let message = report.message.clone().unwrap();
    assert!(message.contains("invalid configuration"));
    assert!(!message.contains("s3cret"));

    let state = h.store.load(&h.key()).await.unwrap().unwrap();
    assert_eq!(state.status, DeploymentStatus::Failed);
    assert_eq!(state.image_tag, V1);
    assert_eq!(state.image_digest.as_deref(), Some("sha256:aaa"));
}

#[tokio::test]
async fn test_overall_timeout_removes_unverified_service() {
    let h = Harness::with_probe(ScriptedProbe::hanging());
    let options = UpOptions {
        rollback: true,
        timeout: Duration::from_millis(50),
    };

    let report = h.up_with(&h.desired(V1, None), options).await;

    assert_eq!(report.outcome, UpOutcome::Removed);
    assert!(report.result.is_none());
    assert!(report.message.as_deref().unwrap().contains("did not complete"));
    assert!(h.store.load(&h.key()).await.unwrap().is_none());
    assert!(h.api.service("foo-dev").is_none());
}

#[tokio::test]
async fn test_timeout_without_rollback_keeps_previous_record() {
    let h = Harness::new();
    h.up(&h.desired(V1, Some("sha256:aaa"))).await;
    h.stall_health(true);
    let options = UpOptions {
        rollback: false,
        timeout: Duration::from_millis(50),
    };

    let report = h.up_with(&h.desired(V2, Some("sha256:bbb")), options.clone()).await;

    assert_eq!(report.outcome, UpOutcome::Unhealthy);
    let state = h.store.load(&h.key()).await.unwrap().unwrap();
    assert_eq!(state.status, DeploymentStatus::Failed);
    assert_eq!(state.image_tag, V1);
    assert_eq!(state.image_digest.as_deref(), Some("sha256:aaa"));
    assert_eq!(report.state, Some(state));

    // nothing recorded for a first deploy that never completed
    let fresh = Harness::new();
    fresh.stall_health(true);
    let report = fresh.up_with(&fresh.desired(V1, None), options).await;
    assert_eq!(report.outcome, UpOutcome::Unhealthy);
    assert!(report.state.is_none());
    assert!(fresh.store.load(&fresh.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_first_up_leaves_generated_secret_for_retry() {
    let h = Harness::new();
    let mut desired = h.desired(V1, None);
    desired.secrets.push(DesiredSecret::generated(
        GeneratedSecret::ApiKey,
        Some(SecretString::from("k".repeat(48))),
    ));
    h.api.reject_next("quota exceeded");

    let report = h.up(&desired).await;

    assert_eq!(report.outcome, UpOutcome::Rejected);
    assert!(h.store.load(&h.key()).await.unwrap().is_none());
    assert_eq!(h.secrets.names(), vec!["foo-dev-api-key".to_string()]);

    // generating again reuses the name and takes ownership of it
    let report = h.up(&desired).await;
    assert_eq!(report.outcome, UpOutcome::Deployed);
    assert!(report.state.as_ref().unwrap().api_key_generated);
    h.reconciler.down(&h.target()).await.unwrap();
    assert_eq!(h.secrets.deletes(), vec!["foo-dev-api-key".to_string()]);
}

#[tokio::test]
async fn test_declined_confirmation_changes_nothing() {
    let h = Harness::new();
    let desired = h.desired(V1, None);

    let report = h
        .reconciler
        .up(&desired, &UpOptions::default(), |_| false)
        .await
        .unwrap();

    assert_eq!(report.outcome, UpOutcome::Aborted);
    assert!(report.succeeded());
    assert!(h.api.mutations().is_empty());
    assert!(h.store.load(&h.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_down_without_state_succeeds() {
    let h = Harness::new();

    let report = h.reconciler.down(&h.target()).await.unwrap();

    assert!(!report.had_state);
    assert!(report.result.success);
    assert_eq!(report.result.status, DeploymentStatus::Deleted);
    assert!(h.api.mutations().is_empty());
    assert!(h.secrets.deletes().is_empty());
}

#[tokio::test]
async fn test_down_deletes_only_generated_secrets() {
    let h = Harness::new();
    let mut desired = Harness::with_secret(h.desired(V1, None), "DB_PASSWORD", "s3cret");
    desired.secrets.push(DesiredSecret::generated(
        GeneratedSecret::ApiKey,
        Some(SecretString::from("k".repeat(48))),
    ));
    h.up(&desired).await;
    assert!(h.store.load(&h.key()).await.unwrap().unwrap().api_key_generated);
    assert_eq!(h.secrets.names().len(), 2);

    let report = h.reconciler.down(&h.target()).await.unwrap();

    assert!(report.had_state);
    assert!(report.result.success);
    assert!(h.api.service("foo-dev").is_none());
    assert_eq!(h.secrets.deletes(), vec!["foo-dev-api-key".to_string()]);
    assert_eq!(h.secrets.names(), vec!["foo-dev-db-password".to_string()]);
    assert!(h.store.load(&h.key()).await.unwrap().is_none());

    // second down finds nothing and still succeeds
    let report = h.reconciler.down(&h.target()).await.unwrap();
    assert!(!report.had_state);
    assert!(report.result.success);
}

#[tokio::test]
async fn test_status_refreshes_and_detects_deletion() {
    let h = Harness::new();
    h.up(&h.desired(V1, None)).await;

    let report = h.reconciler.status(&h.key()).await.unwrap();
    assert_eq!(report.state.status, DeploymentStatus::Running);
    assert_eq!(report.state.health_status, HealthStatus::Healthy);
    assert_eq!(report.health.unwrap().results[0].attempts, 1);

    h.api.delete_service(&arn_for("foo-dev")).await.unwrap();
    let report = h.reconciler.status(&h.key()).await.unwrap();
    assert!(!report.result.success);
    assert_eq!(report.state.status, DeploymentStatus::Deleted);
    let state = h.store.load(&h.key()).await.unwrap().unwrap();
    assert_eq!(state.status, DeploymentStatus::Deleted);
    assert_eq!(state.image_tag, V1);
}

#[tokio::test]
async fn test_status_without_record_is_precondition() {
    let h = Harness::new();
    let err = h.reconciler.status(&h.key()).await.unwrap_err();
    assert!(matches!(err, DeployError::Precondition(_)));
}

#[tokio::test]
async fn test_concurrent_ups_are_serialized() {
    let h = Harness::new();
    let desired = h.desired(V1, Some("sha256:aaa"));

    let (a, b) = tokio::join!(h.up(&desired), h.up(&desired));

    let outcomes = [a.outcome, b.outcome];
    assert!(outcomes.contains(&UpOutcome::Deployed));
    assert!(outcomes.contains(&UpOutcome::UpToDate));
    assert_eq!(h.api.mutations().len(), 2);
}
