//! Local storage under the project's `.deployment/` directory

pub mod layout;
pub mod settings;
pub mod state_store;
