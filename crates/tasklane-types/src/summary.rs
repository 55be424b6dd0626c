//! Point-in-time view of a task context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::ContextStatus;

/// Counters and timing for a task context.
///
/// Returned while the context runs (a live snapshot) and after it finishes
/// (the final record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub key: String,
    pub status: ContextStatus,
    pub succeeded: u64,
    pub failed: u64,
    /// Tasks dropped from the waiting queue by `stop()`.
    pub discarded: u64,
    pub waiting: usize,
    pub executing: usize,
    /// Keys of executing tasks past their advisory timeout.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timed_out: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

impl ContextSummary {
    /// Total number of tasks that reached a terminal status.
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed
    }
}

impl std::fmt::Display for ContextSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} succeeded, {} failed, {} discarded, {} waiting, {} executing, {}ms ({})",
            self.key,
            self.succeeded,
            self.failed,
            self.discarded,
            self.waiting,
            self.executing,
            self.elapsed_ms,
            self.status
        )
    }
}
