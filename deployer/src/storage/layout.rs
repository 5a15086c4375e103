//! Storage layout of the `.deployment/` directory

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Name of the directory created inside the project
pub const DEPLOYMENT_DIR_NAME: &str = ".deployment";

/// Storage layout for one project
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Project root (where the Dockerfile lives)
    pub project_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// `.deployment/`
    pub fn deployment_dir(&self) -> Dir {
        Dir::new(self.project_dir.join(DEPLOYMENT_DIR_NAME))
    }

    /// `.deployment/state/`
    pub fn state_dir(&self) -> Dir {
        self.deployment_dir().subdir("state")
    }

    /// `.deployment/logs/`
    pub fn logs_dir(&self) -> Dir {
        self.deployment_dir().subdir("logs")
    }

    /// `.deployment/settings.json`
    pub fn settings_file(&self) -> File {
        self.deployment_dir().file("settings.json")
    }

    /// `.deployment/docker-compose.yml`
    pub fn compose_file(&self) -> File {
        self.deployment_dir().file("docker-compose.yml")
    }

    pub fn dockerfile(&self) -> File {
        File::new(self.project_dir.join("Dockerfile"))
    }

    fn gitignore_file(&self) -> File {
        File::new(self.project_dir.join(".gitignore"))
    }

    /// Create the directories and keep `.deployment/` out of version control.
    pub async fn setup(&self) -> Result<(), DeployError> {
        self.state_dir().create().await?;
        self.logs_dir().create().await?;
        self.ensure_gitignored().await
    }

    async fn ensure_gitignored(&self) -> Result<(), DeployError> {
        let gitignore = self.gitignore_file();
        let entry = format!("{}/", DEPLOYMENT_DIR_NAME);
        let current = gitignore.read_string_opt().await?.unwrap_or_default();

        let already = current
            .lines()
            .map(str::trim)
            .any(|line| line == entry || line == DEPLOYMENT_DIR_NAME || line == format!("/{}", entry));
        if already {
            return Ok(());
        }

        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry);
        updated.push('\n');
        fs::write(gitignore.path(), updated).await?;
        debug!("Added {} to {}", entry, gitignore.path().display());
        Ok(())
    }
}
