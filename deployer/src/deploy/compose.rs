//! Docker Compose runner for `local`

use std::collections::BTreeMap;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::filesys::file::File;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeFile {
    pub services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeService {
    pub image: String,
    pub container_name: String,
    pub ports: Vec<String>,
    /// `None` values are passed through from the compose process environment
    pub environment: BTreeMap<String, Option<String>>,
    pub restart: String,
}

impl ComposeFile {
    /// Single-service file. Secret keys are listed without values.
    pub fn single(
        name: &str,
        image: &str,
        port: u16,
        env: &BTreeMap<String, String>,
        secret_keys: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut environment: BTreeMap<String, Option<String>> = env
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        for key in secret_keys {
            environment.insert(key, None);
        }

        let service = ComposeService {
            image: image.to_string(),
            container_name: name.to_string(),
            ports: vec![format!("{}:{}", port, port)],
            environment,
            restart: "unless-stopped".to_string(),
        };
        Self {
            services: BTreeMap::from([(name.to_string(), service)]),
        }
    }

    pub fn to_yaml(&self) -> Result<String, DeployError> {
        serde_yaml::to_string(self)
            .map_err(|e| DeployError::Internal(format!("failed to render compose file: {}", e)))
    }

    pub async fn write(&self, file: &File) -> Result<(), DeployError> {
        file.write_atomic(self.to_yaml()?.as_bytes()).await
    }
}

/// `docker compose up -d`, falling back to `docker-compose`.
/// Secret values reach the containers through the child environment only.
pub async fn compose_up(
    compose_file: &Path,
    secrets: &BTreeMap<String, SecretString>,
) -> Result<(), DeployError> {
    info!("Starting Docker Compose application: {}", compose_file.display());
    run_compose(compose_file, &["up", "-d"], secrets).await
}

pub async fn compose_down(compose_file: &Path) -> Result<(), DeployError> {
    run_compose(compose_file, &["down"], &BTreeMap::new()).await
}

/// Lines of container output shown for an unhealthy local service
pub const LOG_TAIL_LINES: u32 = 50;

/// Last `tail` lines of the app's container output.
pub async fn compose_logs(compose_file: &Path, tail: u32) -> Result<String, DeployError> {
    let tail = format!("--tail={}", tail);
    let action = ["logs", "--no-color", tail.as_str()];
    let output = run_compose_with(compose_file, &action, &BTreeMap::new(), true).await?;
    Ok(output.trim_end().to_string())
}

async fn run_compose(
    compose_file: &Path,
    action: &[&str],
    secrets: &BTreeMap<String, SecretString>,
) -> Result<(), DeployError> {
    run_compose_with(compose_file, action, secrets, false).await.map(|_| ())
}

/// Run `action` with the first compose flavour that succeeds. Output is
/// captured and returned when `capture` is set, otherwise inherited.
async fn run_compose_with(
    compose_file: &Path,
    action: &[&str],
    secrets: &BTreeMap<String, SecretString>,
    capture: bool,
) -> Result<String, DeployError> {
    if !compose_file.exists() {
        return Err(DeployError::Precondition(format!(
            "Compose file does not exist: {}",
            compose_file.display()
        )));
    }
    let workdir = compose_file.parent().unwrap_or(Path::new("."));

    let attempts: [(&str, &[&str]); 2] = [("docker", &["compose"]), ("docker-compose", &[])];
    let mut last_error = String::new();
    for (program, prefix) in attempts {
        debug!("Running {} {} {}", program, prefix.join(" "), action.join(" "));
        let mut cmd = Command::new(program);
        cmd.current_dir(workdir)
            .args(prefix)
            .arg("-f")
            .arg(compose_file)
            .args(action);
        for (key, value) in secrets {
            cmd.env(key, value.expose_secret());
        }

        if capture {
            match cmd.output().await {
                Ok(output) if output.status.success() => {
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    return Ok(text);
                }
                Ok(output) => last_error = format!("{} exited with {}", program, output.status),
                Err(e) => last_error = format!("failed to run {}: {}", program, e),
            }
        } else {
            match cmd.status().await {
                Ok(status) if status.success() => return Ok(String::new()),
                Ok(status) => last_error = format!("{} exited with {}", program, status),
                Err(e) => last_error = format!("failed to run {}: {}", program, e),
            }
        }
        debug!("{}", last_error);
    }
    Err(DeployError::CommandError(format!("Docker Compose failed: {}", last_error)))
}
