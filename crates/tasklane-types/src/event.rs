//! Lifecycle events broadcast while tasks and contexts run.
//!
//! `TaskEvent` is the unified event type published on the engine event bus.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

use crate::status::{ContextStatus, TaskStatus};

/// Events emitted by the task driver and the context scheduler.
///
/// Subscribers use these in place of subclass hooks (before/after removal,
/// start and stop callbacks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A context began admitting tasks.
    ContextStarted { context: String, waiting: usize },

    /// A task was moved from the waiting queue into the executing set.
    TaskAdmitted { context: String, task: String },

    /// A task driver started walking its step chain.
    TaskStarted {
        context: Option<String>,
        task: String,
    },

    /// A task stopped at a suspension point.
    TaskPaused {
        context: Option<String>,
        task: String,
        /// Index of the first step that has not completed.
        at_step: usize,
    },

    /// A paused task was handed back to the executor.
    TaskResumed {
        context: Option<String>,
        task: String,
    },

    /// A step asked to be re-run.
    StepRetried {
        context: Option<String>,
        task: String,
        step: usize,
        attempt: u32,
    },

    /// A task reached a terminal status.
    TaskFinished {
        context: Option<String>,
        task: String,
        status: TaskStatus,
        duration_ms: u64,
        error: Option<String>,
    },

    /// A context reached a terminal status.
    ContextFinished {
        context: String,
        status: ContextStatus,
        succeeded: u64,
        failed: u64,
        discarded: u64,
        duration_ms: u64,
    },
}

impl TaskEvent {
    /// Key of the task the event is about, if any.
    pub fn task_key(&self) -> Option<&str> {
        match self {
            Self::TaskAdmitted { task, .. }
            | Self::TaskStarted { task, .. }
            | Self::TaskPaused { task, .. }
            | Self::TaskResumed { task, .. }
            | Self::StepRetried { task, .. }
            | Self::TaskFinished { task, .. } => Some(task),
            Self::ContextStarted { .. } | Self::ContextFinished { .. } => None,
        }
    }

    /// Key of the context the event belongs to. `None` for tasks run on
    /// their own.
    pub fn context_key(&self) -> Option<&str> {
        match self {
            Self::ContextStarted { context, .. }
            | Self::TaskAdmitted { context, .. }
            | Self::ContextFinished { context, .. } => Some(context),
            Self::TaskStarted { context, .. }
            | Self::TaskPaused { context, .. }
            | Self::TaskResumed { context, .. }
            | Self::StepRetried { context, .. }
            | Self::TaskFinished { context, .. } => context.as_deref(),
        }
    }
}
