//! Docker image build and push

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::DeployError;

/// Architecture the managed platforms run
pub const CLOUD_BUILD_PLATFORM: &str = "linux/amd64";

pub async fn docker_available() -> bool {
    Command::new("docker")
        .args(["info", "--format", "{{.ServerVersion}}"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Build `dockerfile` in `context` as `tag`. Build output goes to the terminal.
pub async fn build_image(
    context: &Path,
    dockerfile: &Path,
    tag: &str,
    target_platform: Option<&str>,
) -> Result<(), DeployError> {
    if !dockerfile.exists() {
        return Err(DeployError::Precondition(format!(
            "Dockerfile not found: {}",
            dockerfile.display()
        )));
    }
    info!("Building Docker image: {}", tag);

    let mut cmd = Command::new("docker");
    cmd.arg("build").arg("-t").arg(tag).arg("-f").arg(dockerfile);
    if let Some(platform) = target_platform {
        cmd.arg("--platform").arg(platform);
    }
    cmd.arg(context);

    let status = cmd
        .status()
        .await
        .map_err(|e| DeployError::CommandError(format!("Failed to run docker build: {}", e)))?;
    if !status.success() {
        return Err(DeployError::CommandError(format!("Docker build failed for {}", tag)));
    }
    debug!("Built {}", tag);
    Ok(())
}

/// Push `tag` and return the registry digest (`sha256:...`).
pub async fn push_image(tag: &str) -> Result<String, DeployError> {
    info!("Pushing Docker image: {}", tag);
    let status = Command::new("docker")
        .args(["push", tag])
        .status()
        .await
        .map_err(|e| DeployError::CommandError(format!("Failed to run docker push: {}", e)))?;
    if !status.success() {
        return Err(DeployError::CommandError(format!("Docker push failed for {}", tag)));
    }

    image_digest(tag).await?.ok_or_else(|| {
        DeployError::CommandError(format!("No registry digest recorded for {}", tag))
    })
}

/// Registry digest of a pushed image, `None` for local-only images.
pub async fn image_digest(tag: &str) -> Result<Option<String>, DeployError> {
    let output = Command::new("docker")
        .args(["inspect", "--format", "{{json .RepoDigests}}", tag])
        .output()
        .await
        .map_err(|e| DeployError::CommandError(format!("Failed to run docker inspect: {}", e)))?;
    if !output.status.success() {
        return Ok(None);
    }
    let digests: Vec<String> = serde_json::from_slice(&output.stdout).unwrap_or_default();
    Ok(select_repo_digest(&digests, tag))
}

/// Pick the digest belonging to `tag`'s repository from `RepoDigests`.
pub fn select_repo_digest(repo_digests: &[String], tag: &str) -> Option<String> {
    let repository = repository_of(tag);
    repo_digests
        .iter()
        .filter_map(|entry| entry.split_once('@'))
        .find(|(repo, _)| *repo == repository)
        .or_else(|| repo_digests.first().and_then(|entry| entry.split_once('@')))
        .map(|(_, digest)| digest.to_string())
}

/// `host:5000/repo:tag` -> `host:5000/repo`
pub fn repository_of(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => &image[..idx],
        _ => image,
    }
}
