//! Task engine core for tasklane.
//!
//! This crate holds the step/task/context model and its drivers. Work is
//! submitted through the [`executor::Executor`] port; the dedicated-runtime
//! adapter and file-based configuration live in `tasklane-infra`.

pub mod context;
pub mod event;
pub mod executor;
pub mod step;
pub mod task;

pub use context::{TaskContext, TaskContextBuilder};
pub use executor::{Executor, ExecutorRef, Job, TokioExecutor};
pub use step::{work, Condition, Exhaustion, RetryPolicy, RetryVerdict, StepError, StepFn, StepHandle};
pub use task::{Task, TaskBuilder, TaskOutcome};
