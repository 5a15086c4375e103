//! HTTP probe used by the health verifier

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

/// Result of one probe attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status_code: Option<u16>,
    pub response_time: Duration,
    pub error: Option<String>,
}

impl ProbeOutcome {
    /// Any 2xx counts as a pass
    pub fn passed(&self) -> bool {
        matches!(self.status_code, Some(code) if (200..300).contains(&code))
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}

/// Probe over HTTP(S) with reqwest
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    api_key: Option<SecretString>,
}

impl HttpProbe {
    pub fn new(api_key: Option<SecretString>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("agent-deploy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, api_key })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let started = Instant::now();
        let url = match Url::parse(url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => return invalid_url(format!("unsupported scheme '{}'", url.scheme())),
            Err(e) => return invalid_url(format!("invalid URL: {}", e)),
        };
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key.expose_secret());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                ProbeOutcome {
                    status_code: Some(status.as_u16()),
                    response_time: started.elapsed(),
                    error: if status.is_success() {
                        None
                    } else {
                        Some(format!("HTTP {}", status))
                    },
                }
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("request timed out after {:.1}s", timeout.as_secs_f64())
                } else if e.is_connect() {
                    "connection failed".to_string()
                } else {
                    e.without_url().to_string()
                };
                ProbeOutcome {
                    status_code: None,
                    response_time: started.elapsed(),
                    error: Some(error),
                }
            }
        }
    }
}

fn invalid_url(error: String) -> ProbeOutcome {
    ProbeOutcome {
        status_code: None,
        response_time: Duration::ZERO,
        error: Some(error),
    }
}
