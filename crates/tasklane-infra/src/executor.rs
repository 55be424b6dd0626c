//! Worker pool backed by a dedicated multi-thread tokio runtime.
//!
//! Used when the configuration asks for a fixed number of worker threads
//! instead of sharing the ambient runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tasklane_core::executor::{Executor, ExecutorRef, Job, TokioExecutor};
use tasklane_types::config::ExecutorConfig;
use tokio::runtime::{Builder, Handle, Runtime};

/// Grace period for in-flight jobs when the pool is shut down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct RuntimeExecutor {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    closed: AtomicBool,
    name: String,
}

impl RuntimeExecutor {
    /// Build a runtime with `worker_threads` workers (tokio's default when
    /// unset) named after `thread_name`.
    pub fn new(config: &ExecutorConfig) -> std::io::Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.thread_name(config.thread_name.clone()).enable_all();
        if let Some(workers) = config.worker_threads {
            builder.worker_threads(workers.max(1));
        }
        let runtime = builder.build()?;
        tracing::debug!(
            workers = ?config.worker_threads,
            thread_name = %config.thread_name,
            "dedicated executor runtime started"
        );
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
            name: config.thread_name.clone(),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Executor for RuntimeExecutor {
    fn submit(&self, job: Job) {
        if self.is_shut_down() {
            tracing::warn!(executor = %self.name, "executor shut down, dropping submitted job");
            return;
        }
        self.handle.spawn(job);
    }

    /// Release the runtime on a helper thread. Dropping a runtime is not
    /// allowed from async code, and this may be called from one of its own
    /// workers.
    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let runtime = self
            .runtime
            .lock()
            .expect("executor runtime lock poisoned")
            .take();
        let Some(runtime) = runtime else {
            return;
        };
        let spawned = std::thread::Builder::new()
            .name(format!("{}-shutdown", self.name))
            .spawn(move || runtime.shutdown_timeout(SHUTDOWN_GRACE));
        match spawned {
            Ok(_) => tracing::debug!(executor = %self.name, "dedicated executor runtime released"),
            Err(err) => {
                tracing::error!(executor = %self.name, error = %err, "failed to spawn runtime shutdown thread")
            }
        }
    }
}

impl Drop for RuntimeExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RuntimeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeExecutor")
            .field("name", &self.name)
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

/// Pick the executor described by `config`: a dedicated runtime when worker
/// threads are configured, otherwise the ambient tokio runtime.
///
/// The flag reports whether the executor is dedicated, i.e. whether the
/// context using it should shut it down when finished.
pub fn executor_from_config(config: &ExecutorConfig) -> std::io::Result<(ExecutorRef, bool)> {
    match config.worker_threads {
        Some(_) => Ok((Arc::new(RuntimeExecutor::new(config)?), true)),
        None => Ok((TokioExecutor::shared(), false)),
    }
}
