//! Deployment execution: reconciliation, image builds and local runs

pub mod compose;
pub mod docker;
pub mod reconciler;

pub use reconciler::{Reconciler, Target, UpOptions, UpOutcome, UpReport};
