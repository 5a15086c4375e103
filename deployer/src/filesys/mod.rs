//! Filesystem helpers on top of `tokio::fs`

pub mod dir;
pub mod file;
