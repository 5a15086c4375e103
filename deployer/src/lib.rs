//! Agent deployer library
//!
//! Plans, applies, verifies and tears down containerized service deployments on
//! Google Cloud Run, AWS App Runner and DigitalOcean App Platform.

pub mod app;
pub mod commands;
pub mod deploy;
pub mod drivers;
pub mod errors;
pub mod filesys;
pub mod health;
pub mod logs;
pub mod models;
pub mod secrets;
pub mod storage;
pub mod utils;
