//! Status machines for tasks and contexts.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Task status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
///
/// `Pending -> Ready -> Running -> {Paused, OkStopped, FailStopped}` and
/// `Paused -> Ready -> Running`. The two stopped states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Built but never run.
    Pending,
    Ready,
    Running,
    Paused,
    OkStopped,
    FailStopped,
}

impl TaskStatus {
    /// Whether no further transition can leave this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::OkStopped | Self::FailStopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::OkStopped => "ok_stopped",
            Self::FailStopped => "fail_stopped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Context status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task context (the scheduler).
///
/// `Ready -> Running -> {Paused, Stopping} -> {OkStopped, FailStopped}`.
/// `Stopping` drains in-flight tasks before reaching a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Ready,
    Running,
    Paused,
    Stopping,
    OkStopped,
    FailStopped,
}

impl ContextStatus {
    /// Whether the context has finished for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::OkStopped | Self::FailStopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::OkStopped => "ok_stopped",
            Self::FailStopped => "fail_stopped",
        }
    }
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
