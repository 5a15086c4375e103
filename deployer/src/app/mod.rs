//! Command wiring: target resolution and shared state

pub mod options;
pub mod state;
