//! Thin async wrapper around the provider command line tools

use std::process::Stdio;

use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployError;
use crate::models::Platform;

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CliOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    /// stderr, or stdout when stderr is empty
    pub fn message(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs one provider CLI (`gcloud`, `aws`, `doctl`)
#[derive(Debug, Clone)]
pub struct CliRunner {
    program: String,
    platform: Platform,
}

impl CliRunner {
    pub fn new(program: impl Into<String>, platform: Platform) -> Self {
        Self {
            program: program.into(),
            platform,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run and capture output. Secret material goes through `stdin`, never argv.
    pub async fn output(&self, args: &[String], stdin: Option<&[u8]>) -> Result<CliOutput, DeployError> {
        debug!("Running {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DeployError::Precondition(format!("failed to run {}: {}", self.program, e))
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and fail with a provider error on non-zero exit.
    pub async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<String, DeployError> {
        let output = self.output(args, stdin).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(DeployError::provider(
                self.platform.as_str(),
                format!("{} {}: {}", self.program, subcommand(args), output.message()),
            ))
        }
    }

    /// Run and parse stdout as JSON.
    pub async fn run_json<T: DeserializeOwned>(
        &self,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<T, DeployError> {
        let stdout = self.run(args, stdin).await?;
        serde_json::from_str(&stdout).map_err(|e| {
            DeployError::provider(
                self.platform.as_str(),
                format!("unexpected {} output: {}", self.program, e),
            )
        })
    }

    /// Whether the tool is installed and answers `args`
    pub async fn probe(&self, args: &[String]) -> bool {
        matches!(self.output(args, None).await, Ok(out) if out.success)
    }
}

/// Leading non-flag words, for error messages
fn subcommand(args: &[String]) -> String {
    args.iter()
        .take_while(|a| !a.starts_with('-'))
        .take(3)
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a CLI error means the resource does not exist
pub fn is_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found")
        || lower.contains("notfound")
        || lower.contains("not_found")
        || lower.contains("could not find")
        || lower.contains("cannot find")
        || lower.contains("does not exist")
        || lower.contains("resourcenotfoundexception")
        || lower.contains("404")
}

/// `["a", "b"]` as owned argv
pub fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
