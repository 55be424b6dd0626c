use thiserror::Error;

use crate::status::{ContextStatus, TaskStatus};

/// Rejected operations on a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task '{key}' cannot {operation} while {status}")]
    InvalidState {
        key: String,
        operation: &'static str,
        status: TaskStatus,
    },
}

/// Rejected operations on a task context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context '{context}' already stopped ({status}), cannot add task '{task}'")]
    Terminated {
        context: String,
        task: String,
        status: ContextStatus,
    },

    #[error("context '{context}' is stopping, cannot add task '{task}'")]
    Stopping { context: String, task: String },

    #[error("task '{task}' already belongs to context '{owner}'")]
    TaskAlreadyOwned { task: String, owner: String },

    #[error("task '{task}' already started ({status})")]
    TaskAlreadyStarted { task: String, status: TaskStatus },
}
