//! Worker-pool port used by tasks and contexts.
//!
//! The engine never spawns on its own: task drivers, resumptions and
//! parallel-step branches are all handed to an [`Executor`] as boxed futures.
//! [`TokioExecutor`] is the default adapter; a dedicated-runtime adapter lives
//! in `tasklane-infra`.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::runtime::Handle;

/// A unit of work submitted to an executor.
pub type Job = BoxFuture<'static, ()>;

/// Asynchronous, non-blocking job submission.
///
/// Implementations must eventually run every submitted job but make no
/// fairness or ordering promise.
pub trait Executor: Send + Sync {
    /// Hand a job to the pool. Must not block the caller.
    fn submit(&self, job: Job);

    /// Release pool resources. Called by a context that owns its executor
    /// once the context reaches a terminal status.
    fn shutdown(&self) {}
}

/// Shared executor reference.
pub type ExecutorRef = Arc<dyn Executor>;

// ---------------------------------------------------------------------------
// TokioExecutor
// ---------------------------------------------------------------------------

/// Spawns jobs onto a tokio runtime.
///
/// Holds the handle captured at construction if one was available; otherwise
/// the ambient runtime is looked up at submit time.
#[derive(Debug, Clone, Default)]
pub struct TokioExecutor {
    handle: Option<Handle>,
}

impl TokioExecutor {
    /// Spawn onto the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Capture the current runtime if called from inside one.
    pub fn current() -> Self {
        Self {
            handle: Handle::try_current().ok(),
        }
    }

    pub fn shared() -> ExecutorRef {
        Arc::new(Self::current())
    }
}

impl Executor for TokioExecutor {
    fn submit(&self, job: Job) {
        let handle = self.handle.clone().or_else(|| Handle::try_current().ok());
        match handle {
            Some(handle) => {
                handle.spawn(job);
            }
            None => {
                tracing::error!("no tokio runtime available, dropping submitted job");
            }
        }
    }
}
