//! Reconciliation engine.
//!
//! The only writer of [`DeploymentState`]. Every operation takes the store lock for
//! its whole load-modify-save sequence, and a record is written only after the step
//! it describes has completed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::drivers::Driver;
use crate::errors::DeployError;
use crate::health::verifier::{HealthReport, HealthVerifier};
use crate::models::state::provider_keys;
use crate::models::{
    DeploymentPlan, DeploymentResult, DeploymentState, DeploymentStatus, DesiredService,
    HealthStatus, StateKey, CURRENT_SCHEMA_VERSION,
};
use crate::secrets::GeneratedSecret;
use crate::storage::state_store::FileStateStore;

/// Knobs for one `up`
#[derive(Debug, Clone)]
pub struct UpOptions {
    /// Roll back (or remove) on failed verification
    pub rollback: bool,
    /// Bound on driver `up` plus health verification
    pub timeout: Duration,
}

impl Default for UpOptions {
    fn default() -> Self {
        Self {
            rollback: true,
            timeout: Duration::from_secs(300),
        }
    }
}

/// How an `up` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpOutcome {
    /// Plan was all NOOP; nothing touched
    UpToDate,
    /// Declined at the confirmation prompt
    Aborted,
    Deployed,
    /// Provider rejected the change
    Rejected,
    /// Unhealthy; restored the previous healthy deployment
    RolledBack,
    /// Unhealthy with nothing to roll back to; service removed
    Removed,
    /// Unhealthy and left in place
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpReport {
    pub outcome: UpOutcome,
    pub plan: DeploymentPlan,
    pub result: Option<DeploymentResult>,
    pub health: Option<HealthReport>,
    pub rollback: Option<DeploymentResult>,
    /// Record as persisted, `None` when there is none
    pub state: Option<DeploymentState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UpReport {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.outcome,
            UpOutcome::UpToDate | UpOutcome::Deployed | UpOutcome::Aborted
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownReport {
    /// Whether a local record existed
    pub had_state: bool,
    pub result: DeploymentResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: DeploymentState,
    pub result: DeploymentResult,
    pub health: Option<HealthReport>,
}

/// Where to look for a service that may have no local record
#[derive(Debug, Clone)]
pub struct Target {
    pub key: StateKey,
    pub region: String,
    pub project_id: Option<String>,
}

pub struct Reconciler {
    store: Arc<FileStateStore>,
    driver: Arc<dyn Driver>,
    verifier: Arc<HealthVerifier>,
}

impl Reconciler {
    pub fn new(
        store: Arc<FileStateStore>,
        driver: Arc<dyn Driver>,
        verifier: Arc<HealthVerifier>,
    ) -> Self {
        Self {
            store,
            driver,
            verifier,
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Compute the plan without applying it.
    pub async fn plan(&self, desired: &DesiredService) -> Result<DeploymentPlan, DeployError> {
        let current = self.store.load(&desired.key()).await?;
        self.driver.plan(desired, current.as_ref()).await
    }

    /// Plan, confirm, apply, verify, then persist or roll back.
    pub async fn up<F>(
        &self,
        desired: &DesiredService,
        options: &UpOptions,
        confirm: F,
    ) -> Result<UpReport, DeployError>
    where
        F: FnOnce(&DeploymentPlan) -> bool + Send,
    {
        let key = desired.key();
        let _guard = self.store.lock().await;

        let previous = self.store.load(&key).await?;
        let plan = self.driver.plan(desired, previous.as_ref()).await?;
        let mut report = UpReport {
            outcome: UpOutcome::UpToDate,
            plan,
            result: None,
            health: None,
            rollback: None,
            state: previous.clone(),
            message: None,
        };

        if report.plan.is_noop() {
            info!(key = %key, "Deployment is up to date");
            return Ok(report);
        }
        if !confirm(&report.plan) {
            report.outcome = UpOutcome::Aborted;
            return Ok(report);
        }

        let applied = tokio::time::timeout(options.timeout, self.apply_and_verify(&report.plan)).await;
        let (result, health) = match applied {
            Ok((result, health)) => (Some(result), health),
            Err(_) => {
                warn!(key = %key, timeout = ?options.timeout, "Deployment timed out");
                report.message = Some(format!(
                    "deployment did not complete within {:?}",
                    options.timeout
                ));
                (None, None)
            }
        };
        report.result = result.clone();
        report.health = health.clone();

        // Provider rejected the change: only the status of the old record moves.
        if let Some(result) = result.as_ref().filter(|r| !r.success) {
            error!(key = %key, "Deployment rejected: {}", result.message());
            report.outcome = UpOutcome::Rejected;
            report.message = result.error_message.clone();
            if let Some(mut prev) = previous {
                prev.status = DeploymentStatus::Failed;
                prev.updated_at = Utc::now();
                self.store.save(&prev).await?;
                report.state = Some(prev);
            }
            return Ok(report);
        }

        if let (Some(result), Some(health)) = (&result, &health) {
            if health.passed() {
                let mut state = new_state(
                    &report.plan,
                    result,
                    previous.as_ref(),
                    DeploymentStatus::Running,
                    HealthStatus::Healthy,
                );
                state.mark_healthy_release();
                self.store.save(&state).await?;
                info!(key = %key, url = ?state.service_url, "Deployment healthy");
                report.outcome = UpOutcome::Deployed;
                report.state = Some(state);
                return Ok(report);
            }
            report.message = Some(format!("health verification failed: {}", health.diagnostics()));
        }

        self.handle_unhealthy(&key, &mut report, previous, options).await?;
        Ok(report)
    }

    async fn apply_and_verify(&self, plan: &DeploymentPlan) -> (DeploymentResult, Option<HealthReport>) {
        let result = self.driver.up(plan).await;
        if !result.success {
            return (result, None);
        }
        let health = match &result.service_url {
            Some(url) => self.verifier.verify(url).await,
            None => HealthReport::from_results(Vec::new()),
        };
        (result, Some(health))
    }

    async fn handle_unhealthy(
        &self,
        key: &StateKey,
        report: &mut UpReport,
        previous: Option<DeploymentState>,
        options: &UpOptions,
    ) -> Result<(), DeployError> {
        let observed_health = report
            .health
            .as_ref()
            .map(|h| h.overall)
            .unwrap_or(HealthStatus::Unknown);

        if !options.rollback {
            report.outcome = UpOutcome::Unhealthy;
            // Timed out: the new configuration never finished applying.
            let Some(result) = report.result.clone() else {
                warn!(key = %key, "Rollback disabled, deployment did not complete");
                if let Some(mut prev) = previous {
                    prev.status = DeploymentStatus::Failed;
                    prev.updated_at = Utc::now();
                    self.store.save(&prev).await?;
                    report.state = Some(prev);
                }
                return Ok(());
            };

            warn!(key = %key, "Rollback disabled, recording failed deployment");
            let state = new_state(
                &report.plan,
                &result,
                previous.as_ref(),
                DeploymentStatus::Failed,
                if observed_health == HealthStatus::Healthy {
                    HealthStatus::Unknown
                } else {
                    observed_health
                },
            );
            self.store.save(&state).await?;
            report.state = Some(state);
            return Ok(());
        }

        let release = previous.as_ref().and_then(DeploymentState::healthy_release);
        match (previous, release) {
            (Some(prev), Some(release)) => {
                warn!(key = %key, image = %release.image_tag, "Rolling back to last healthy deployment");
                let mut prev = prev.restored(&release);
                let rollback = self.driver.rollback(&prev).await;
                prev.status = if rollback.success {
                    DeploymentStatus::RolledBack
                } else {
                    error!(key = %key, "Rollback failed: {}", rollback.message());
                    DeploymentStatus::Failed
                };
                prev.health_status = HealthStatus::Unknown;
                prev.updated_at = Utc::now();
                self.store.save(&prev).await?;
                report.outcome = UpOutcome::RolledBack;
                report.rollback = Some(rollback);
                report.state = Some(prev);
            }
            (previous, _) => {
                warn!(key = %key, "No healthy deployment to roll back to, removing service");
                // Flags stay false so secrets survive for the next attempt.
                let transient = new_state(
                    &report.plan,
                    &report.result.clone().unwrap_or_default(),
                    None,
                    DeploymentStatus::Failed,
                    observed_health,
                );
                let removal = self.driver.down(&transient).await;
                if removal.success {
                    self.store.delete(key).await?;
                    report.outcome = UpOutcome::Removed;
                    report.state = None;
                } else {
                    error!(key = %key, "Removing unhealthy service failed: {}", removal.message());
                    let mut state = new_state(
                        &report.plan,
                        &report.result.clone().unwrap_or_default(),
                        previous.as_ref(),
                        DeploymentStatus::Failed,
                        observed_health,
                    );
                    if let Some(prev) = &previous {
                        state.api_key_generated |= prev.api_key_generated;
                        state.rsa_key_generated |= prev.rsa_key_generated;
                    }
                    self.store.save(&state).await?;
                    report.outcome = UpOutcome::Unhealthy;
                    report.state = Some(state);
                }
                report.rollback = Some(removal);
            }
        }
        Ok(())
    }

    /// Delete the service and owned secrets, then the record. Absent is success.
    pub async fn down(&self, target: &Target) -> Result<DownReport, DeployError> {
        let _guard = self.store.lock().await;
        let existing = self.store.load(&target.key).await?;
        let had_state = existing.is_some();
        let state = existing.unwrap_or_else(|| placeholder_state(target));

        let result = self.driver.down(&state).await;
        if result.success {
            self.store.delete(&target.key).await?;
            info!(key = %target.key, "Deployment removed");
        } else {
            error!(key = %target.key, "Teardown failed: {}", result.message());
        }
        Ok(DownReport { had_state, result })
    }

    /// Refresh URL, revision, status and health of a recorded deployment.
    pub async fn status(&self, key: &StateKey) -> Result<StatusReport, DeployError> {
        let _guard = self.store.lock().await;
        let mut state = self.store.load(key).await?.ok_or_else(|| {
            DeployError::Precondition(format!("no deployment recorded for {}", key))
        })?;

        let result = self.driver.status(&state).await;
        let mut health = None;

        if result.success {
            if let Some(url) = &result.service_url {
                health = Some(self.verifier.check_once(url).await);
            }
            state.service_url = result.service_url.clone().or(state.service_url);
            state.revision = result.revision.clone().or(state.revision);
            state.status = result.status;
            state.health_status = health
                .as_ref()
                .map(|h| h.overall)
                .unwrap_or(HealthStatus::Unknown);
        } else if result.status == DeploymentStatus::Deleted {
            state.status = DeploymentStatus::Deleted;
            state.health_status = HealthStatus::Unknown;
        } else {
            return Ok(StatusReport {
                state,
                result,
                health,
            });
        }

        state.updated_at = Utc::now();
        self.store.save(&state).await?;
        Ok(StatusReport {
            state,
            result,
            health,
        })
    }
}

/// Record describing `plan` as applied with `result`
fn new_state(
    plan: &DeploymentPlan,
    result: &DeploymentResult,
    previous: Option<&DeploymentState>,
    status: DeploymentStatus,
    health_status: HealthStatus,
) -> DeploymentState {
    let now = Utc::now();
    let mut provider_data = previous
        .map(|p| p.provider_data.clone())
        .unwrap_or_default();
    provider_data.insert(provider_keys::ENV_DIGEST.to_string(), plan.env_digest.clone().into());
    provider_data.insert(provider_keys::SECRET_KEYS.to_string(), plan.secret_keys.clone().into());
    provider_data.insert(provider_keys::IMAGE_REF.to_string(), plan.target_image.clone().into());
    let mut env = plan.env_vars.clone();
    if let Some(url) = &result.service_url {
        env.insert(plan.public_url_var.clone(), url.clone());
    }
    provider_data.insert(provider_keys::ENV_VARS.to_string(), json!(env));
    let secret_names: BTreeMap<&str, &str> = plan
        .secrets
        .iter()
        .map(|s| (s.env_key.as_str(), s.secret_name.as_str()))
        .collect();
    provider_data.insert(provider_keys::SECRET_NAMES.to_string(), json!(secret_names));
    match result.service_id.clone().or_else(|| plan.current_service_id.clone()) {
        Some(id) => {
            provider_data.insert(provider_keys::SERVICE_ID.to_string(), id.into());
        }
        None => {
            provider_data.remove(provider_keys::SERVICE_ID);
        }
    }

    DeploymentState {
        version: CURRENT_SCHEMA_VERSION,
        service_name: plan.service_name.clone(),
        platform: plan.platform,
        environment: plan.environment,
        region: plan.region.clone(),
        project_id: plan.project_id.clone(),
        image_tag: plan.target_image.clone(),
        image_digest: result.image_digest.clone().or_else(|| plan.target_digest.clone()),
        service_url: result.service_url.clone(),
        revision: result.revision.clone(),
        created_at: previous.map(|p| p.created_at).unwrap_or(now),
        updated_at: now,
        status,
        health_status,
        port: plan.target_port,
        api_key_generated: previous.is_some_and(|p| p.api_key_generated)
            || plan.generated(GeneratedSecret::ApiKey),
        rsa_key_generated: previous.is_some_and(|p| p.rsa_key_generated)
            || plan.generated(GeneratedSecret::RsaKey),
        provider_data,
    }
}

/// Stand-in record for tearing down a service with no local state.
/// Ownership flags are false, so no secrets are deleted.
fn placeholder_state(target: &Target) -> DeploymentState {
    let now = Utc::now();
    DeploymentState {
        version: CURRENT_SCHEMA_VERSION,
        service_name: target.key.service_name.clone(),
        platform: target.key.platform,
        environment: target.key.environment,
        region: target.region.clone(),
        project_id: target.project_id.clone(),
        image_tag: String::new(),
        image_digest: None,
        service_url: None,
        revision: None,
        created_at: now,
        updated_at: now,
        status: DeploymentStatus::Unknown,
        health_status: HealthStatus::Unknown,
        port: 0,
        api_key_generated: false,
        rsa_key_generated: false,
        provider_data: Default::default(),
    }
}
