//! Utility functions

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use tokio::process::Command;

use serde::Serialize;

use crate::errors::DeployError;

/// `--version` output with build metadata
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Version information for the deployer
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Exponential backoff options
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Delay before retry number `retry` (1-based): `base * multiplier^(retry-1)`, capped.
pub fn calc_exp_backoff(options: &BackoffOptions, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(exponent);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    if !capped_delay.is_finite() || capped_delay < 0.0 {
        return options.max_delay;
    }
    Duration::from_secs_f64(capped_delay)
}

/// Calculate SHA256 hash of data as lowercase hex
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Digest of a set of `KEY=VALUE` pairs, independent of input order.
pub fn digest_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut lines: Vec<String> = pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    lines.sort();
    sha256_hash(lines.join("\n").as_bytes())
}

/// `API_KEY` -> `api-key`
pub fn to_kebab(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '.' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Derive a provider-safe service name from a project directory.
pub fn service_name_from_dir(dir: &Path) -> Option<String> {
    let name = dir.file_name()?.to_str()?;
    let name = to_kebab(name);
    let name = name.trim_matches('-').to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Short git commit hash of the repository at `dir`, if it is one.
pub async fn git_short_sha(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(dir)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        None
    } else {
        Some(sha)
    }
}

/// Random URL-safe API key (32 bytes of entropy).
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// 2048-bit RSA private key encoded as PKCS#8 PEM.
pub fn generate_rsa_private_key() -> Result<String, DeployError> {
    let key = RsaPrivateKey::new(&mut OsRng, 2048)
        .map_err(|e| DeployError::Internal(format!("rsa key generation failed: {}", e)))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| DeployError::Internal(format!("rsa key encoding failed: {}", e)))?;
    Ok(pem.to_string())
}

/// Split `KEY=VALUE`; the value may itself contain `=`.
pub fn parse_key_value(raw: &str) -> Result<(String, String), DeployError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| DeployError::InvalidInput(format!("expected KEY=VALUE, got '{}'", key_only(raw))))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(DeployError::InvalidInput("empty key in KEY=VALUE pair".to_string()));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DeployError::InvalidInput(format!(
            "invalid environment variable name '{}'",
            key
        )));
    }
    Ok((key.to_string(), value.to_string()))
}

// Never echo what might be a secret value back in an error.
fn key_only(raw: &str) -> &str {
    raw.split('=').next().unwrap_or_default()
}

/// Human-readable byte size
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
