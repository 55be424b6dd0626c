//! Shared domain types for tasklane.
//!
//! This crate contains the plain types used across the engine: task and
//! context status machines, lifecycle events, configuration and the
//! rejected-operation errors.
//!
//! Zero runtime dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod status;
pub mod summary;
