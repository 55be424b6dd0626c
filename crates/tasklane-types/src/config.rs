//! Engine configuration types.
//!
//! `EngineConfig` mirrors the `tasklane.toml` file. Every field has a serde
//! default so an empty file (or no file) yields a working configuration.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Scheduler settings for a task context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum number of tasks in the executing set.
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,

    /// Advisory per-task timeout. Only reported, never enforced.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

fn default_parallel_limit() -> usize {
    10
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            parallel_limit: default_parallel_limit(),
            task_timeout_secs: None,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Worker threads for a dedicated runtime. `None` uses the ambient runtime.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

fn default_thread_name() -> String {
    "tasklane-worker".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name(),
        }
    }
}

/// Defaults for bounded-retry steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of re-runs after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between attempts in milliseconds (0 = none).
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: 0,
        }
    }
}
