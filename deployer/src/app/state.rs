//! Application state shared by the commands

use std::sync::Arc;

use secrecy::SecretString;
use tracing::debug;

use crate::deploy::{Reconciler, Target};
use crate::drivers::{create_driver, Driver, DriverConfig};
use crate::errors::DeployError;
use crate::health::clock::{Clock, TokioClock};
use crate::health::probe::HttpProbe;
use crate::health::verifier::{HealthCheckConfig, HealthVerifier};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::storage::state_store::FileStateStore;

/// Everything a command needs besides its own arguments
pub struct AppState {
    pub layout: StorageLayout,
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<FileStateStore>,
}

impl AppState {
    pub fn new(layout: StorageLayout, settings: Settings) -> Self {
        let store = Arc::new(FileStateStore::new(layout.state_dir()));
        Self {
            layout,
            settings,
            clock: Arc::new(TokioClock::new()),
            store,
        }
    }

    /// Create `.deployment/` on first use.
    pub async fn setup(&self) -> Result<(), DeployError> {
        self.layout.setup().await
    }

    pub fn driver_config(&self, target: &Target) -> DriverConfig {
        DriverConfig {
            poll_interval: self.settings.poll_interval(),
            ready_timeout: self.settings.deploy_timeout(),
            ..DriverConfig::new(target.region.clone(), target.project_id.clone())
        }
    }

    pub fn driver(&self, target: &Target) -> Result<Arc<dyn Driver>, DeployError> {
        debug!(platform = %target.key.platform, region = %target.region, "Creating driver");
        create_driver(target.key.platform, self.driver_config(target), self.clock.clone())
    }

    /// Verifier sending `api_key` as `X-API-Key` when known.
    pub fn verifier(&self, api_key: Option<SecretString>) -> Result<Arc<HealthVerifier>, DeployError> {
        let config = HealthCheckConfig::from(&self.settings.health);
        config.validate()?;
        let probe = HttpProbe::new(api_key)?;
        Ok(Arc::new(HealthVerifier::new(
            config,
            Arc::new(probe),
            self.clock.clone(),
        )))
    }

    /// Driver plus verifier, after failing fast on missing prerequisites.
    pub async fn reconciler(
        &self,
        target: &Target,
        api_key: Option<SecretString>,
    ) -> Result<Reconciler, DeployError> {
        let driver = self.driver(target)?;
        let problems = driver.check_prerequisites().await;
        if !problems.is_empty() {
            return Err(DeployError::Precondition(problems.join("; ")));
        }
        Ok(Reconciler::new(
            self.store.clone(),
            driver,
            self.verifier(api_key)?,
        ))
    }
}
