//! Infrastructure adapters for tasklane.
//!
//! Implements the pieces the engine core leaves to its host: loading the
//! TOML configuration file and a worker pool backed by a dedicated tokio
//! runtime.

pub mod config;
pub mod executor;
