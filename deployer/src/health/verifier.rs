//! Health verification with bounded retries and exponential backoff.
//!
//! Each endpoint runs its own [`EndpointMachine`]: a probe either passes (2xx) or
//! fails, consecutive passes count towards the success threshold, and any failure
//! resets that count. Delays come from [`calc_exp_backoff`] and every sleep goes
//! through the injected [`Clock`], so schedules can be checked without real time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::health::clock::Clock;
use crate::health::probe::{Probe, ProbeOutcome};
use crate::models::HealthStatus;
use crate::storage::settings::HealthSettings;
use crate::utils::{calc_exp_backoff, BackoffOptions};

/// Configuration of one verification pass
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
    /// Hard ceiling across all attempts, per endpoint
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: BackoffOptions,
    pub success_threshold: u32,
    pub endpoints: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for HealthCheckConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_secs),
            max_retries: settings.max_retries,
            backoff: settings.backoff(),
            success_threshold: settings.success_threshold,
            endpoints: settings.endpoints.clone(),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.endpoints.is_empty() {
            return Err(DeployError::InvalidInput(
                "at least one health endpoint is required".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(DeployError::InvalidInput(
                "health success threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold > self.max_retries + 1 {
            return Err(DeployError::InvalidInput(format!(
                "success threshold {} cannot be reached with {} retries",
                self.success_threshold, self.max_retries
            )));
        }
        if !(self.backoff.multiplier >= 1.0) {
            return Err(DeployError::InvalidInput(
                "backoff multiplier must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub endpoint: String,
    pub url: String,
    pub status: HealthStatus,
    #[serde(serialize_with = "serialize_millis")]
    pub response_time: Duration,
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

fn serialize_millis<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u128(d.as_millis())
}

/// Aggregate over all configured endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub results: Vec<HealthCheckResult>,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_response_time_ms: Option<u128>,
}

impl HealthReport {
    pub fn from_results(results: Vec<HealthCheckResult>) -> Self {
        let healthy: Vec<&HealthCheckResult> = results
            .iter()
            .filter(|r| r.status == HealthStatus::Healthy)
            .collect();
        let healthy_count = healthy.len();
        let unhealthy_count = results.len() - healthy_count;

        let overall = if results.is_empty() {
            HealthStatus::Unknown
        } else if unhealthy_count == 0 {
            HealthStatus::Healthy
        } else if healthy_count == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        let success_rate = if results.is_empty() {
            0.0
        } else {
            healthy_count as f64 / results.len() as f64
        };

        let avg_response_time_ms = if healthy.is_empty() {
            None
        } else {
            let total: u128 = healthy.iter().map(|r| r.response_time.as_millis()).sum();
            Some(total / healthy.len() as u128)
        };

        Self {
            overall,
            results,
            healthy_count,
            unhealthy_count,
            success_rate,
            avg_response_time_ms,
        }
    }

    pub fn passed(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }

    /// One line per failing endpoint
    pub fn diagnostics(&self) -> String {
        self.results
            .iter()
            .filter(|r| r.status != HealthStatus::Healthy)
            .map(|r| {
                format!(
                    "{} after {} attempt(s): {}",
                    r.endpoint,
                    r.attempts,
                    r.error.as_deref().unwrap_or("unhealthy")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Per-endpoint probe state
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeState {
    Pending,
    /// Wait this long, then probe again
    Backoff(Duration),
    Passed,
    Failed,
}

/// Transition function for one endpoint, independent of time and I/O
#[derive(Debug, Clone)]
pub struct EndpointMachine {
    max_retries: u32,
    success_threshold: u32,
    backoff: BackoffOptions,
    attempts: u32,
    consecutive_passes: u32,
    state: ProbeState,
}

impl EndpointMachine {
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            success_threshold: config.success_threshold.max(1),
            backoff: config.backoff.clone(),
            attempts: 0,
            consecutive_passes: 0,
            state: ProbeState::Pending,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn state(&self) -> &ProbeState {
        &self.state
    }

    /// Feed one attempt's verdict and get the next state.
    pub fn record(&mut self, passed: bool) -> &ProbeState {
        self.attempts += 1;
        if passed {
            self.consecutive_passes += 1;
        } else {
            self.consecutive_passes = 0;
        }

        let retries_used = self.attempts - 1;
        self.state = if self.consecutive_passes >= self.success_threshold {
            ProbeState::Passed
        } else if retries_used >= self.max_retries {
            ProbeState::Failed
        } else {
            ProbeState::Backoff(calc_exp_backoff(&self.backoff, self.attempts))
        };
        &self.state
    }
}

/// Polls the configured endpoints of a service until healthy, exhausted or timed out
pub struct HealthVerifier {
    config: HealthCheckConfig,
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
}

impl HealthVerifier {
    pub fn new(config: HealthCheckConfig, probe: Arc<dyn Probe>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            probe,
            clock,
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Full verification with retries. Endpoints are probed concurrently.
    pub async fn verify(&self, base_url: &str) -> HealthReport {
        info!(
            url = base_url,
            endpoints = self.config.endpoints.len(),
            "Verifying service health"
        );
        let checks = self
            .config
            .endpoints
            .iter()
            .map(|endpoint| self.verify_endpoint(base_url, endpoint));
        let report = HealthReport::from_results(join_all(checks).await);

        if report.passed() {
            info!(url = base_url, "Service is healthy");
        } else {
            warn!(url = base_url, overall = %report.overall, "{}", report.diagnostics());
        }
        report
    }

    /// A single probe per endpoint, no retries.
    pub async fn check_once(&self, base_url: &str) -> HealthReport {
        let checks = self.config.endpoints.iter().map(|endpoint| async move {
            let url = endpoint_url(base_url, endpoint);
            let outcome = self.probe.probe(&url, self.config.request_timeout).await;
            let status = if outcome.passed() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            to_result(endpoint, url, status, outcome, 1)
        });
        HealthReport::from_results(join_all(checks).await)
    }

    async fn verify_endpoint(&self, base_url: &str, endpoint: &str) -> HealthCheckResult {
        let url = endpoint_url(base_url, endpoint);
        let deadline = self.clock.elapsed() + self.config.timeout;
        let mut machine = EndpointMachine::new(&self.config);
        let mut last = ProbeOutcome {
            status_code: None,
            response_time: Duration::ZERO,
            error: None,
        };

        loop {
            let remaining = deadline.saturating_sub(self.clock.elapsed());
            if remaining.is_zero() {
                return self.timed_out(endpoint, url, last, machine.attempts());
            }

            let request_timeout = self.config.request_timeout.min(remaining);
            last = self.probe.probe(&url, request_timeout).await;
            debug!(
                url = %url,
                attempt = machine.attempts() + 1,
                status_code = ?last.status_code,
                "Health probe"
            );

            match machine.record(last.passed()).clone() {
                ProbeState::Passed => {
                    return to_result(endpoint, url, HealthStatus::Healthy, last, machine.attempts());
                }
                ProbeState::Failed | ProbeState::Pending => {
                    let mut result =
                        to_result(endpoint, url, HealthStatus::Unhealthy, last, machine.attempts());
                    let reason = result.error.take().unwrap_or_else(|| "not ready".to_string());
                    result.error = Some(format!("retries exhausted, last error: {}", reason));
                    return result;
                }
                ProbeState::Backoff(delay) => {
                    if self.clock.elapsed() + delay >= deadline {
                        return self.timed_out(endpoint, url, last, machine.attempts());
                    }
                    debug!(url = %url, delay_ms = delay.as_millis() as u64, "Retrying health probe");
                    self.clock.sleep(delay).await;
                }
            }
        }
    }

    fn timed_out(
        &self,
        endpoint: &str,
        url: String,
        last: ProbeOutcome,
        attempts: u32,
    ) -> HealthCheckResult {
        let mut result = to_result(endpoint, url, HealthStatus::Unhealthy, last, attempts);
        let reason = match result.error.take() {
            Some(e) => format!(", last error: {}", e),
            None => String::new(),
        };
        result.error = Some(format!(
            "timed out after {}s{}",
            self.config.timeout.as_secs(),
            reason
        ));
        result
    }
}

fn to_result(
    endpoint: &str,
    url: String,
    status: HealthStatus,
    outcome: ProbeOutcome,
    attempts: u32,
) -> HealthCheckResult {
    HealthCheckResult {
        endpoint: endpoint.to_string(),
        url,
        status,
        response_time: outcome.response_time,
        status_code: outcome.status_code,
        error: outcome.error,
        attempts,
        timestamp: Utc::now(),
    }
}

/// Join a base URL and an endpoint path
pub fn endpoint_url(base_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if endpoint.starts_with('/') {
        format!("{}{}", base, endpoint)
    } else {
        format!("{}/{}", base, endpoint)
    }
}
