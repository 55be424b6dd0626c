//! Steps: the atomic execution unit of a task.
//!
//! A [`Step`] wraps one work function together with an explicit
//! [`RetryPolicy`] and an optional eligibility [`Condition`]. Plain steps,
//! bounded-retry steps and fan-out/join steps are all the same data shape;
//! only the function and the policy values differ.
//!
//! Work functions receive the previous step's result (or the task input for
//! the first step) and a [`StepHandle`] through which they can inspect their
//! attempt count and reach their task and context.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use serde_json::Value;
use tasklane_types::config::RetryConfig;
use tokio::sync::oneshot;

use crate::context::TaskContext;
use crate::executor::Job;
use crate::task::{Task, TaskInner};

// ---------------------------------------------------------------------------
// Function types
// ---------------------------------------------------------------------------

/// Boxed work function: `(input, handle) -> result`.
pub type StepFn =
    Arc<dyn Fn(Value, StepHandle) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Eligibility condition evaluated by the task driver before each attempt.
pub type Condition = Arc<dyn Fn(&StepHandle) -> bool + Send + Sync>;

/// Retry predicate: `(result, handle) -> should_retry`.
pub type RetryPredicate = Arc<dyn Fn(&Value, &StepHandle) -> bool + Send + Sync>;

/// Box an async closure into a [`StepFn`].
///
/// Used for parallel branches, where closures of different types share one
/// list:
///
/// ```ignore
/// Task::builder("page").parallel(vec![
///     work(|url, _| async move { fetch_headers(url).await }),
///     work(|url, _| async move { fetch_body(url).await }),
/// ]);
/// ```
pub fn work<F, Fut>(f: F) -> StepFn
where
    F: Fn(Value, StepHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |input: Value, me: StepHandle| f(input, me).boxed())
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Failures that stop a step and fail its task.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The work function returned an error.
    #[error("work function failed: {0:#}")]
    Work(anyhow::Error),

    /// The work function panicked.
    #[error("work function panicked: {0}")]
    Panicked(String),

    /// A bounded retry ran out of attempts under `Exhaustion::Fail`.
    #[error("retries exhausted after {attempts} attempts (limit {limit})")]
    RetryExhausted { attempts: u32, limit: u32 },

    /// First failure observed among the branches of a parallel step.
    #[error("parallel branch {index} failed: {source} ({suppressed} more branch failures)")]
    Branch {
        index: usize,
        source: Box<StepError>,
        suppressed: usize,
    },

    /// A branch was dropped by the executor before it reported back.
    #[error("parallel branch {index} was dropped before completing")]
    BranchDropped { index: usize },

    /// The step's running guard was already held.
    #[error("step {index} is already running")]
    Reentered { index: usize },
}

impl StepError {
    fn from_work(err: anyhow::Error) -> Self {
        match err.downcast::<StepError>() {
            Ok(step_err) => step_err,
            Err(err) => Self::Work(err),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// What a bounded retry does once its limit is spent and the predicate still
/// asks for another run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exhaustion {
    /// Complete the step with the last result and log a warning.
    #[default]
    Accept,
    /// Fail the step with [`StepError::RetryExhausted`].
    Fail,
}

/// Verdict of evaluating a retry policy against one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    Complete,
    Retry,
    /// The predicate asked for a retry but the limit is spent.
    Exhausted,
}

/// Re-run policy over a *returned* result. Errors are never retried.
#[derive(Clone, Default)]
pub enum RetryPolicy {
    #[default]
    Never,
    /// Re-run while `predicate` says so, at most `limit` times after the
    /// first attempt.
    Bounded {
        limit: u32,
        predicate: RetryPredicate,
        on_exhausted: Exhaustion,
        backoff: Option<Duration>,
    },
}

impl RetryPolicy {
    pub fn bounded<P>(limit: u32, predicate: P) -> Self
    where
        P: Fn(&Value, &StepHandle) -> bool + Send + Sync + 'static,
    {
        Self::Bounded {
            limit,
            predicate: Arc::new(predicate),
            on_exhausted: Exhaustion::Accept,
            backoff: None,
        }
    }

    /// Bounded policy with limit and backoff taken from configuration.
    pub fn from_config<P>(config: &RetryConfig, predicate: P) -> Self
    where
        P: Fn(&Value, &StepHandle) -> bool + Send + Sync + 'static,
    {
        let policy = Self::bounded(config.max_retries, predicate);
        if config.backoff_ms > 0 {
            policy.with_backoff(Duration::from_millis(config.backoff_ms))
        } else {
            policy
        }
    }

    /// Treat running out of retries as a step failure.
    pub fn fail_when_exhausted(self) -> Self {
        match self {
            Self::Bounded {
                limit,
                predicate,
                backoff,
                ..
            } => Self::Bounded {
                limit,
                predicate,
                on_exhausted: Exhaustion::Fail,
                backoff,
            },
            Self::Never => Self::Never,
        }
    }

    /// Sleep between attempts instead of yielding.
    pub fn with_backoff(self, delay: Duration) -> Self {
        match self {
            Self::Bounded {
                limit,
                predicate,
                on_exhausted,
                ..
            } => Self::Bounded {
                limit,
                predicate,
                on_exhausted,
                backoff: Some(delay),
            },
            Self::Never => Self::Never,
        }
    }

    pub fn limit(&self) -> Option<u32> {
        match self {
            Self::Never => None,
            Self::Bounded { limit, .. } => Some(*limit),
        }
    }

    pub fn on_exhausted(&self) -> Exhaustion {
        match self {
            Self::Never => Exhaustion::Accept,
            Self::Bounded { on_exhausted, .. } => *on_exhausted,
        }
    }

    pub fn backoff(&self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::Bounded { backoff, .. } => *backoff,
        }
    }

    /// Decide what happens to `result` after attempt number `me.times()`.
    pub fn evaluate(&self, result: &Value, me: &StepHandle) -> RetryVerdict {
        match self {
            Self::Never => RetryVerdict::Complete,
            Self::Bounded {
                limit, predicate, ..
            } => {
                if !predicate(result, me) {
                    RetryVerdict::Complete
                } else if me.times() > *limit {
                    RetryVerdict::Exhausted
                } else {
                    RetryVerdict::Retry
                }
            }
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Bounded {
                limit,
                on_exhausted,
                backoff,
                ..
            } => f
                .debug_struct("Bounded")
                .field("limit", limit)
                .field("on_exhausted", on_exhausted)
                .field("backoff", backoff)
                .finish_non_exhaustive(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepHandle
// ---------------------------------------------------------------------------

/// The self-reference handed to work functions, conditions and predicates.
#[derive(Clone)]
pub struct StepHandle {
    task: Arc<TaskInner>,
    index: usize,
}

impl StepHandle {
    pub(crate) fn new(task: Arc<TaskInner>, index: usize) -> Self {
        Self { task, index }
    }

    fn step(&self) -> &Step {
        &self.task.steps[self.index]
    }

    /// Zero-based position of the step in its task.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of times the work function has been entered, including the
    /// current attempt.
    pub fn times(&self) -> u32 {
        self.step().times()
    }

    pub fn name(&self) -> Option<&str> {
        self.step().name.as_deref()
    }

    /// `"<task> step <name or ordinal>"`, for log lines.
    pub fn label(&self) -> String {
        match self.name() {
            Some(name) => format!("{} step {name}", self.task.key()),
            None => format!("{} step #{}", self.task.key(), self.index + 1),
        }
    }

    pub fn task(&self) -> Task {
        Task::from_inner(Arc::clone(&self.task))
    }

    pub fn context(&self) -> Option<TaskContext> {
        self.task.context()
    }

    /// Read a shared attribute of the owning context.
    pub fn get_attr(&self, key: &str) -> Option<Value> {
        self.context().and_then(|ctx| ctx.get_attr(key))
    }

    /// Write a shared attribute of the owning context, returning the previous
    /// value. Standalone tasks have no attribute store.
    pub fn set_attr(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        match self.context() {
            Some(ctx) => ctx.set_attr(key, value),
            None => {
                tracing::warn!(step = %self.label(), "set_attr on a task without context ignored");
                None
            }
        }
    }

    pub(crate) fn submit(&self, job: Job) {
        self.task.exec(job);
    }
}

impl std::fmt::Debug for StepHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepHandle")
            .field("task", &self.task.key())
            .field("index", &self.index)
            .field("times", &self.times())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Result of one `apply` call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepOutcome {
    Completed(Value),
    /// The retry policy asked for another run with the same input.
    Retry,
}

/// Clears the running flag when the attempt ends, including on error.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) struct Step {
    pub(crate) name: Option<String>,
    func: StepFn,
    retry: RetryPolicy,
    condition: Option<Condition>,
    times: AtomicU32,
    end: AtomicBool,
    running: AtomicBool,
    result: Mutex<Value>,
}

impl Step {
    pub(crate) fn new(func: StepFn, retry: RetryPolicy, condition: Option<Condition>) -> Self {
        Self {
            name: None,
            func,
            retry,
            condition,
            times: AtomicU32::new(0),
            end: AtomicBool::new(false),
            running: AtomicBool::new(false),
            result: Mutex::new(Value::Null),
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.end.load(Ordering::Acquire)
    }

    pub(crate) fn times(&self) -> u32 {
        self.times.load(Ordering::Acquire)
    }

    pub(crate) fn cached(&self) -> Value {
        self.result.lock().expect("step result lock poisoned").clone()
    }

    pub(crate) fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    pub(crate) fn backoff(&self) -> Option<Duration> {
        self.retry.backoff()
    }

    fn complete(&self, value: Value) {
        *self.result.lock().expect("step result lock poisoned") = value;
        self.end.store(true, Ordering::Release);
    }

    /// Run the work function once.
    ///
    /// A completed step returns its cached result without running again.
    pub(crate) async fn apply(&self, input: Value, me: StepHandle) -> Result<StepOutcome, StepError> {
        if self.is_completed() {
            return Ok(StepOutcome::Completed(self.cached()));
        }
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            return Err(StepError::Reentered { index: me.index() });
        };

        let attempt = self.times.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(step = me.index(), attempt, "running step");

        let func = Arc::clone(&self.func);
        let call_handle = me.clone();
        let outcome = AssertUnwindSafe(async move { func(input, call_handle).await })
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Err(StepError::from_work(err)),
            Err(payload) => return Err(StepError::Panicked(panic_message(&*payload))),
        };

        match self.retry.evaluate(&result, &me) {
            RetryVerdict::Complete => {
                self.complete(result.clone());
                Ok(StepOutcome::Completed(result))
            }
            RetryVerdict::Retry => {
                *self.result.lock().expect("step result lock poisoned") = Value::Null;
                Ok(StepOutcome::Retry)
            }
            RetryVerdict::Exhausted => {
                let limit = self.retry.limit().unwrap_or_default();
                match self.retry.on_exhausted() {
                    Exhaustion::Accept => {
                        tracing::warn!(
                            step = %me.label(),
                            attempts = attempt,
                            limit,
                            "retry limit reached, accepting last result"
                        );
                        self.complete(result.clone());
                        Ok(StepOutcome::Completed(result))
                    }
                    Exhaustion::Fail => Err(StepError::RetryExhausted {
                        attempts: attempt,
                        limit,
                    }),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out / join
// ---------------------------------------------------------------------------

/// Build the work function of a parallel step.
///
/// Every branch receives the same input and is submitted to the task's
/// executor. The step waits for all branches and returns a JSON array whose
/// element `i` is branch `i`'s result, whatever the completion order.
pub(crate) fn fan_out(branches: Vec<StepFn>) -> StepFn {
    let branches: Arc<[StepFn]> = branches.into();
    Arc::new(move |input: Value, me: StepHandle| {
        let branches = Arc::clone(&branches);
        async move {
            join_branches(&branches, input, me)
                .await
                .map_err(anyhow::Error::from)
        }
        .boxed()
    })
}

type BranchReport = Result<anyhow::Result<Value>, String>;

async fn join_branches(
    branches: &[StepFn],
    input: Value,
    me: StepHandle,
) -> Result<Value, StepError> {
    let mut pending = FuturesUnordered::new();
    for (index, branch) in branches.iter().enumerate() {
        let (tx, rx) = oneshot::channel::<BranchReport>();
        let fut = branch(input.clone(), me.clone());
        me.submit(
            async move {
                let report = AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .map_err(|payload| panic_message(&*payload));
                let _ = tx.send(report);
            }
            .boxed(),
        );
        pending.push(async move { (index, rx.await) });
    }

    let mut results = vec![Value::Null; branches.len()];
    let mut first_failure: Option<(usize, StepError)> = None;
    let mut suppressed = 0;

    while let Some((index, received)) = pending.next().await {
        let failure = match received {
            Ok(Ok(Ok(value))) => {
                results[index] = value;
                continue;
            }
            Ok(Ok(Err(err))) => StepError::from_work(err),
            Ok(Err(message)) => StepError::Panicked(message),
            Err(_) => StepError::BranchDropped { index },
        };
        if first_failure.is_none() {
            first_failure = Some((index, failure));
        } else {
            suppressed += 1;
            tracing::warn!(
                step = %me.label(),
                branch = index,
                error = %failure,
                "additional parallel branch failure"
            );
        }
    }

    match first_failure {
        None => Ok(Value::Array(results)),
        Some((index, source)) => Err(StepError::Branch {
            index,
            source: Box::new(source),
            suppressed,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn handle_for(task: &Task, index: usize) -> StepHandle {
        StepHandle::new(Arc::clone(task.inner()), index)
    }

    fn counting_task(counter: Arc<AtomicUsize>, retry: RetryPolicy) -> Task {
        Task::builder("counting")
            .re_step_with(retry, None, move |input, _me| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(input)
                }
            })
            .build()
    }

    // -------------------------------------------------------------------
    // RetryPolicy
    // -------------------------------------------------------------------

    #[test]
    fn never_policy_always_completes() {
        let task = Task::builder("t").step(|_, _| async { Ok(Value::Null) }).build();
        let me = handle_for(&task, 0);
        assert_eq!(RetryPolicy::Never.evaluate(&Value::Null, &me), RetryVerdict::Complete);
        assert_eq!(RetryPolicy::Never.limit(), None);
    }

    #[test]
    fn from_config_copies_limit_and_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            backoff_ms: 20,
        };
        let policy = RetryPolicy::from_config(&config, |_, _| true);
        assert_eq!(policy.limit(), Some(5));
        assert_eq!(policy.backoff(), Some(Duration::from_millis(20)));
        assert_eq!(policy.on_exhausted(), Exhaustion::Accept);

        let strict = policy.fail_when_exhausted();
        assert_eq!(strict.on_exhausted(), Exhaustion::Fail);
        assert_eq!(strict.limit(), Some(5));
    }

    #[test]
    fn debug_hides_predicate() {
        let policy = RetryPolicy::bounded(2, |_, _| true);
        let debug = format!("{policy:?}");
        assert!(debug.contains("Bounded"));
        assert!(debug.contains("limit: 2"));
    }

    // -------------------------------------------------------------------
    // Step::apply
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn completed_step_returns_cached_result_without_rerunning() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(Arc::clone(&counter), RetryPolicy::Never);
        let step = &task.inner().steps[0];
        let me = handle_for(&task, 0);

        let first = step.apply(json!("a"), me.clone()).await.unwrap();
        assert_eq!(first, StepOutcome::Completed(json!("a")));

        let second = step.apply(json!("different"), me).await.unwrap();
        assert_eq!(second, StepOutcome::Completed(json!("a")));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(step.times(), 1);
    }

    #[tokio::test]
    async fn always_retrying_step_stops_after_limit_plus_one() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(Arc::clone(&counter), RetryPolicy::bounded(3, |_, _| true));
        let step = &task.inner().steps[0];
        let me = handle_for(&task, 0);

        let mut attempts = 0;
        loop {
            attempts += 1;
            match step.apply(Value::Null, me.clone()).await.unwrap() {
                StepOutcome::Completed(_) => break,
                StepOutcome::Retry => assert!(attempts < 10, "retry never stopped"),
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(step.is_completed());
    }

    #[tokio::test]
    async fn exhausted_fail_policy_surfaces_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(
            Arc::clone(&counter),
            RetryPolicy::bounded(1, |_, _| true).fail_when_exhausted(),
        );
        let step = &task.inner().steps[0];
        let me = handle_for(&task, 0);

        assert_eq!(step.apply(Value::Null, me.clone()).await.unwrap(), StepOutcome::Retry);
        let err = step.apply(Value::Null, me).await.unwrap_err();
        assert!(matches!(err, StepError::RetryExhausted { attempts: 2, limit: 1 }));
        assert!(!step.is_completed());
    }

    #[tokio::test]
    async fn retry_clears_cached_result() {
        let task = Task::builder("t")
            .re_step(2, |_, me| async move { Ok(json!(me.times())) }, |r, _| r == &json!(1))
            .build();
        let step = &task.inner().steps[0];
        let me = handle_for(&task, 0);

        assert_eq!(step.apply(Value::Null, me.clone()).await.unwrap(), StepOutcome::Retry);
        assert_eq!(step.cached(), Value::Null);
        assert_eq!(
            step.apply(Value::Null, me).await.unwrap(),
            StepOutcome::Completed(json!(2))
        );
    }

    #[tokio::test]
    async fn work_error_is_not_retried() {
        let task = Task::builder("t")
            .re_step(
                5,
                |_, _| async { Err(anyhow::anyhow!("boom")) },
                |_, _| true,
            )
            .build();
        let step = &task.inner().steps[0];
        let err = step.apply(Value::Null, handle_for(&task, 0)).await.unwrap_err();
        assert!(matches!(err, StepError::Work(_)));
        assert!(err.to_string().contains("boom"));
        assert_eq!(step.times(), 1);
    }

    #[tokio::test]
    async fn panic_is_captured_as_error() {
        let task = Task::builder("t")
            .step(|_, _| async {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            })
            .build();
        let step = &task.inner().steps[0];
        let err = step.apply(Value::Null, handle_for(&task, 0)).await.unwrap_err();
        match err {
            StepError::Panicked(message) => assert!(message.contains("kaboom")),
            other => panic!("expected Panicked, got {other:?}"),
        }
        // The running guard was released.
        assert!(!step.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn held_guard_rejects_reentry() {
        let task = Task::builder("t").step(|_, _| async { Ok(Value::Null) }).build();
        let step = &task.inner().steps[0];
        step.running.store(true, Ordering::SeqCst);

        let err = step.apply(Value::Null, handle_for(&task, 0)).await.unwrap_err();
        assert!(matches!(err, StepError::Reentered { index: 0 }));
        assert_eq!(step.times(), 0);
    }

    // -------------------------------------------------------------------
    // Fan-out / join
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn parallel_results_follow_submission_order() {
        let task = Task::builder("fan")
            .parallel(vec![
                work(|input, _| async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(json!(format!("slow:{}", input.as_str().unwrap_or_default())))
                }),
                work(|input, _| async move {
                    Ok(json!(format!("fast:{}", input.as_str().unwrap_or_default())))
                }),
            ])
            .build();
        let step = &task.inner().steps[0];

        let outcome = step.apply(json!("x"), handle_for(&task, 0)).await.unwrap();
        assert_eq!(outcome, StepOutcome::Completed(json!(["slow:x", "fast:x"])));
    }

    #[tokio::test]
    async fn parallel_failure_reports_first_and_counts_the_rest() {
        let task = Task::builder("fan")
            .parallel(vec![
                work(|_, _| async { Ok(json!(1)) }),
                work(|_, _| async { Err(anyhow::anyhow!("first")) }),
                work(|_, _| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(anyhow::anyhow!("second"))
                }),
            ])
            .build();
        let step = &task.inner().steps[0];

        let err = step.apply(Value::Null, handle_for(&task, 0)).await.unwrap_err();
        match err {
            StepError::Branch {
                index,
                source,
                suppressed,
            } => {
                assert_eq!(index, 1);
                assert!(source.to_string().contains("first"));
                assert_eq!(suppressed, 1);
            }
            other => panic!("expected Branch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn parallel_branch_panic_fails_step() {
        let task = Task::builder("fan")
            .parallel(vec![work(|_, _| async {
                if true {
                    panic!("branch blew up");
                }
                Ok(Value::Null)
            })])
            .build();
        let step = &task.inner().steps[0];

        let err = step.apply(Value::Null, handle_for(&task, 0)).await.unwrap_err();
        match err {
            StepError::Branch { source, .. } => {
                assert!(matches!(*source, StepError::Panicked(ref m) if m.contains("branch blew up")));
            }
            other => panic!("expected Branch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_parallel_yields_empty_array() {
        let task = Task::builder("fan").parallel(Vec::new()).build();
        let step = &task.inner().steps[0];
        let outcome = step.apply(Value::Null, handle_for(&task, 0)).await.unwrap();
        assert_eq!(outcome, StepOutcome::Completed(json!([])));
    }

    #[test]
    fn label_uses_name_or_ordinal() {
        let task = Task::builder("page")
            .step(|_, _| async { Ok(Value::Null) })
            .named("fetch")
            .step(|_, _| async { Ok(Value::Null) })
            .build();
        assert_eq!(handle_for(&task, 0).label(), "page step fetch");
        assert_eq!(handle_for(&task, 1).label(), "page step #2");
        assert_eq!(handle_for(&task, 1).name(), None);
    }
}
