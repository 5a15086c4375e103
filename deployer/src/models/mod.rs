//! Data model shared by the drivers, the reconciler and the commands

pub mod plan;
pub mod result;
pub mod state;

pub use plan::{ActionType, DeploymentPlan, DesiredService, PlannedSecret, ResourceAction, ResourceType};
pub use result::DeploymentResult;
pub use state::{
    DeploymentState, DeploymentStatus, Environment, HealthStatus, HealthyRelease, Platform,
    StateKey, CURRENT_SCHEMA_VERSION,
};
