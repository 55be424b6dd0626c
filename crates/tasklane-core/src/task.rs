//! Tasks: ordered step chains with a suspendable, single-flight driver.
//!
//! A [`Task`] is built once with [`TaskBuilder`] and then driven by at most
//! one driver at a time. The driver walks the steps in order, piping each
//! result into the next step, and checks for a pause request before every
//! attempt. Completed steps are never re-run: a resumed driver replays their
//! cached results and continues at the first incomplete step.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;
use tasklane_types::error::TaskError;
use tasklane_types::event::TaskEvent;
use tasklane_types::status::TaskStatus;
use tokio::sync::watch;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::context::{ContextInner, TaskContext};
use crate::event::EventBus;
use crate::executor::{Executor, ExecutorRef, Job, TokioExecutor};
use crate::step::{
    fan_out, work, Condition, RetryPolicy, Step, StepError, StepFn, StepHandle, StepOutcome,
};

// ---------------------------------------------------------------------------
// TaskBuilder
// ---------------------------------------------------------------------------

/// Fluent construction of a [`Task`].
///
/// Steps run in the order they are added.
///
/// ```ignore
/// let task = Task::builder("page-1")
///     .step(|url, _| async move { fetch(url).await })
///     .re_step(3, |page, _| async move { parse(page).await }, |r, _| r.is_null())
///     .named("parse")
///     .build();
/// ```
pub struct TaskBuilder {
    key: String,
    steps: Vec<Step>,
    input: Value,
    executor: Option<ExecutorRef>,
    timeout: Option<Duration>,
    events: Option<EventBus>,
    span: Option<Span>,
}

impl TaskBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            steps: Vec::new(),
            input: Value::Null,
            executor: None,
            timeout: None,
            events: None,
            span: None,
        }
    }

    fn push(mut self, func: StepFn, retry: RetryPolicy, condition: Option<Condition>) -> Self {
        self.steps.push(Step::new(func, retry, condition));
        self
    }

    /// Append a plain step.
    pub fn step<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Value, StepHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.push(work(f), RetryPolicy::Never, None)
    }

    /// Append a step that only runs once `condition` holds. While it does
    /// not, the task parks itself until resumed.
    pub fn step_when<C, F, Fut>(self, condition: C, f: F) -> Self
    where
        C: Fn(&StepHandle) -> bool + Send + Sync + 'static,
        F: Fn(Value, StepHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.push(work(f), RetryPolicy::Never, Some(Arc::new(condition)))
    }

    /// Append a step that is re-run with the same input while `should_retry`
    /// holds, at most `limit` extra times.
    pub fn re_step<F, Fut, P>(self, limit: u32, f: F, should_retry: P) -> Self
    where
        F: Fn(Value, StepHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
        P: Fn(&Value, &StepHandle) -> bool + Send + Sync + 'static,
    {
        self.push(work(f), RetryPolicy::bounded(limit, should_retry), None)
    }

    /// Append a step with an explicit retry policy and optional condition.
    pub fn re_step_with<F, Fut>(self, policy: RetryPolicy, condition: Option<Condition>, f: F) -> Self
    where
        F: Fn(Value, StepHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.push(work(f), policy, condition)
    }

    /// Append a fan-out/join step. The step's result is a JSON array of the
    /// branch results in the order given here.
    pub fn parallel(self, branches: Vec<StepFn>) -> Self {
        self.push(fan_out(branches), RetryPolicy::Never, None)
    }

    pub fn parallel_when<C>(self, condition: C, branches: Vec<StepFn>) -> Self
    where
        C: Fn(&StepHandle) -> bool + Send + Sync + 'static,
    {
        self.push(fan_out(branches), RetryPolicy::Never, Some(Arc::new(condition)))
    }

    /// Name the most recently added step.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        match self.steps.last_mut() {
            Some(step) => step.name = Some(name.into()),
            None => tracing::warn!(task = %self.key, "named() called before any step was added"),
        }
        self
    }

    /// Input handed to the first step when the task is started without one.
    pub fn input(mut self, input: impl Into<Value>) -> Self {
        self.input = input.into();
        self
    }

    /// Executor for a task that runs outside any context.
    pub fn executor(mut self, executor: ExecutorRef) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Soft deadline reported through [`Task::is_timed_out`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Parent span for the driver's spans. Defaults to the span current at
    /// `build()`.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Task {
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        Task {
            inner: Arc::new(TaskInner {
                key: self.key,
                steps: self.steps,
                state: Mutex::new(TaskState {
                    status: TaskStatus::Pending,
                    driving: false,
                    released: false,
                    input: self.input,
                    output: Value::Null,
                    error: None,
                    started_at: None,
                    started: None,
                }),
                gate: Mutex::new(()),
                status_tx,
                context: OnceLock::new(),
                executor: self.executor,
                timeout: self.timeout,
                events: self.events,
                span: self.span.unwrap_or_else(Span::current),
            }),
        }
    }
}

impl Default for TaskBuilder {
    /// Builder with a generated `task-<uuid>` key.
    fn default() -> Self {
        Self::new(format!("task-{}", Uuid::now_v7()))
    }
}

impl From<TaskBuilder> for Task {
    fn from(builder: TaskBuilder) -> Self {
        builder.build()
    }
}

// ---------------------------------------------------------------------------
// TaskInner
// ---------------------------------------------------------------------------

struct TaskState {
    status: TaskStatus,
    /// True while a driver owns the step loop.
    driving: bool,
    /// Set by the first `run`. A task paused before release goes back to
    /// `Pending` on resume instead of being driven.
    released: bool,
    input: Value,
    output: Value,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
}

/// Back-reference to the owning context, set once on admission.
struct ContextLink {
    key: String,
    inner: Weak<ContextInner>,
}

pub(crate) struct TaskInner {
    key: String,
    pub(crate) steps: Vec<Step>,
    state: Mutex<TaskState>,
    /// Serializes condition evaluation against `resume`, so a resume cannot
    /// slip between a failed condition check and the park.
    gate: Mutex<()>,
    status_tx: watch::Sender<TaskStatus>,
    context: OnceLock<ContextLink>,
    executor: Option<ExecutorRef>,
    timeout: Option<Duration>,
    events: Option<EventBus>,
    span: Span,
}

impl TaskInner {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.state.lock().expect("task state lock poisoned")
    }

    fn set_status(&self, state: &mut TaskState, status: TaskStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.lock_state().status
    }

    pub(crate) fn context_inner(&self) -> Option<Arc<ContextInner>> {
        self.context.get().and_then(|link| link.inner.upgrade())
    }

    pub(crate) fn context(&self) -> Option<TaskContext> {
        self.context_inner().map(TaskContext::from_inner)
    }

    pub(crate) fn context_key(&self) -> Option<&str> {
        self.context.get().map(|link| link.key.as_str())
    }

    /// Attach this task to a context. Fails with the current owner's key if
    /// the task already belongs to one.
    pub(crate) fn bind_context(&self, key: &str, inner: Weak<ContextInner>) -> Result<(), String> {
        let link = ContextLink {
            key: key.to_string(),
            inner,
        };
        self.context.set(link).map_err(|_| {
            self.context_key()
                .map(str::to_string)
                .unwrap_or_default()
        })
    }

    /// Submit a job to the context executor, the task executor, or the
    /// ambient tokio runtime, in that order.
    pub(crate) fn exec(&self, job: Job) {
        if let Some(ctx) = self.context_inner() {
            ctx.submit(job);
        } else if let Some(executor) = &self.executor {
            executor.submit(job);
        } else {
            TokioExecutor::current().submit(job);
        }
    }

    /// Publish on the task's own bus, falling back to the context bus.
    fn publish(&self, event: TaskEvent) {
        match (&self.events, self.context_inner()) {
            (Some(events), _) => events.publish(event),
            (None, Some(ctx)) => ctx.publish(event),
            (None, None) => {}
        }
    }

    fn first_incomplete(&self) -> usize {
        self.steps
            .iter()
            .position(|step| !step.is_completed())
            .unwrap_or(self.steps.len())
    }

    fn is_timed_out_with(&self, fallback: Option<Duration>) -> bool {
        let Some(limit) = self.timeout.or(fallback) else {
            return false;
        };
        let state = self.lock_state();
        !state.status.is_terminal() && state.started.is_some_and(|s| s.elapsed() > limit)
    }

    fn outcome(&self) -> TaskOutcome {
        let state = self.lock_state();
        TaskOutcome {
            status: state.status,
            output: state.output.clone(),
            error: state.error.clone(),
        }
    }

    // -- driver -------------------------------------------------------------

    /// Claim the step loop. Only a `Ready` task without an active driver can
    /// be driven.
    fn begin_drive(&self) -> bool {
        let mut state = self.lock_state();
        if state.status != TaskStatus::Ready || state.driving {
            return false;
        }
        state.driving = true;
        if state.started.is_none() {
            state.started = Some(Instant::now());
            state.started_at = Some(Utc::now());
        }
        self.set_status(&mut state, TaskStatus::Running);
        true
    }

    pub(crate) async fn drive(self: Arc<Self>) -> TaskOutcome {
        if !self.begin_drive() {
            return self.outcome();
        }
        let span = tracing::info_span!(
            parent: &self.span,
            "task",
            task = %self.key,
            context = self.context_key().unwrap_or("-")
        );
        Arc::clone(&self).walk().instrument(span).await
    }

    async fn walk(self: Arc<Self>) -> TaskOutcome {
        let resume_at = self.first_incomplete();
        tracing::debug!(resume_at, steps = self.steps.len(), "driver started");
        self.publish(TaskEvent::TaskStarted {
            context: self.context_key().map(str::to_string),
            task: self.key.clone(),
        });

        let mut carried = self.lock_state().input.clone();
        let mut failure: Option<StepError> = None;

        'steps: for (index, step) in self.steps.iter().enumerate() {
            if self.park_if_paused(index) {
                return self.outcome();
            }
            if step.is_completed() {
                carried = step.cached();
                continue;
            }

            let me = StepHandle::new(Arc::clone(&self), index);
            if let Some(condition) = step.condition() {
                if self.park_unless(index, || condition(&me)) {
                    return self.outcome();
                }
            }

            loop {
                let span = tracing::debug_span!("step", index, name = step.name.as_deref());
                match step.apply(carried.clone(), me.clone()).instrument(span).await {
                    Ok(StepOutcome::Completed(value)) => {
                        carried = value;
                        break;
                    }
                    Ok(StepOutcome::Retry) => {
                        let attempt = step.times();
                        tracing::debug!(step = index, attempt, "step asked to be retried");
                        self.publish(TaskEvent::StepRetried {
                            context: self.context_key().map(str::to_string),
                            task: self.key.clone(),
                            step: index,
                            attempt,
                        });
                        if self.park_if_paused(index) {
                            return self.outcome();
                        }
                        match step.backoff() {
                            Some(delay) => tokio::time::sleep(delay).await,
                            None => tokio::task::yield_now().await,
                        }
                    }
                    Err(err) => {
                        tracing::error!(step = %me.label(), error = %err, "step failed");
                        failure = Some(err);
                        break 'steps;
                    }
                }
            }
        }

        self.finish(carried, failure)
    }

    /// Exit the driver if a pause was requested.
    fn park_if_paused(&self, index: usize) -> bool {
        {
            let mut state = self.lock_state();
            if state.status != TaskStatus::Paused {
                return false;
            }
            state.driving = false;
        }
        tracing::info!(at_step = index, "task paused");
        self.publish_paused(index);
        true
    }

    /// Evaluate a step condition; if it does not hold, pause and exit the
    /// driver. Runs under the resume gate.
    fn park_unless(&self, index: usize, eligible: impl FnOnce() -> bool) -> bool {
        let _gate = self.gate.lock().expect("task gate lock poisoned");
        if eligible() {
            return false;
        }
        {
            let mut state = self.lock_state();
            state.driving = false;
            self.set_status(&mut state, TaskStatus::Paused);
        }
        tracing::debug!(at_step = index, "step condition not met, parking task");
        self.publish_paused(index);
        true
    }

    fn publish_paused(&self, index: usize) {
        self.publish(TaskEvent::TaskPaused {
            context: self.context_key().map(str::to_string),
            task: self.key.clone(),
            at_step: index,
        });
    }

    fn finish(self: &Arc<Self>, output: Value, failure: Option<StepError>) -> TaskOutcome {
        let (outcome, elapsed) = {
            let mut state = self.lock_state();
            state.driving = false;
            match &failure {
                Some(err) => {
                    state.error = Some(err.to_string());
                    self.set_status(&mut state, TaskStatus::FailStopped);
                }
                None if self.steps.iter().all(Step::is_completed) => {
                    state.output = output;
                    self.set_status(&mut state, TaskStatus::OkStopped);
                }
                None => {}
            }
            let outcome = TaskOutcome {
                status: state.status,
                output: state.output.clone(),
                error: state.error.clone(),
            };
            (outcome, state.started.map(|s| s.elapsed()).unwrap_or_default())
        };

        if outcome.status.is_terminal() {
            let duration_ms = elapsed.as_millis() as u64;
            tracing::info!(status = %outcome.status, duration_ms, "task finished");
            self.publish(TaskEvent::TaskFinished {
                context: self.context_key().map(str::to_string),
                task: self.key.clone(),
                status: outcome.status,
                duration_ms,
                error: outcome.error.clone(),
            });
            if let Some(ctx) = self.context_inner() {
                ctx.remove_task(self);
            }
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Final state of one driver run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    /// Result of the last step, `Null` unless the task finished successfully.
    pub output: Value,
    pub error: Option<String>,
}

/// A cheaply clonable handle to a task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn builder(key: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(key)
    }

    pub(crate) fn from_inner(inner: Arc<TaskInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<TaskInner> {
        &self.inner
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.status()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock_state().started_at
    }

    pub fn step_count(&self) -> usize {
        self.inner.steps.len()
    }

    pub fn completed_steps(&self) -> usize {
        self.inner.steps.iter().filter(|s| s.is_completed()).count()
    }

    /// True once every step has completed.
    pub fn is_completed(&self) -> bool {
        self.inner.steps.iter().all(Step::is_completed)
    }

    pub fn output(&self) -> Value {
        self.inner.lock_state().output.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock_state().error.clone()
    }

    pub fn context(&self) -> Option<TaskContext> {
        self.inner.context()
    }

    /// True when the task has been running longer than its timeout (or its
    /// context's task timeout) without finishing.
    pub fn is_timed_out(&self) -> bool {
        let fallback = self.inner.context_inner().and_then(|ctx| ctx.task_timeout());
        self.inner.is_timed_out_with(fallback)
    }

    /// Drive the task on the current future until it stops.
    ///
    /// A non-null `input` replaces the builder input. Returns when the task
    /// finishes or pauses; a paused task is picked up again by [`resume`].
    /// A task suspended before its first run returns at once with a `Paused`
    /// outcome and starts on the next resume.
    ///
    /// [`resume`]: Task::resume
    pub async fn run(&self, input: Value) -> Result<TaskOutcome, TaskError> {
        {
            let mut state = self.inner.lock_state();
            match state.status {
                TaskStatus::Pending | TaskStatus::Ready => {}
                TaskStatus::Paused if !state.released => {
                    // Paused before it ever ran: keep the input, let resume drive it.
                    if !input.is_null() {
                        state.input = input;
                    }
                    state.released = true;
                    tracing::debug!(task = %self.key(), "task paused before start, deferring run");
                    return Ok(TaskOutcome {
                        status: state.status,
                        output: state.output.clone(),
                        error: state.error.clone(),
                    });
                }
                status => {
                    tracing::warn!(task = %self.key(), %status, "task already started, ignoring run");
                    return Err(TaskError::InvalidState {
                        key: self.key().to_string(),
                        operation: "run",
                        status,
                    });
                }
            }
            if !input.is_null() {
                state.input = input;
            }
            state.released = true;
            self.inner.set_status(&mut state, TaskStatus::Ready);
        }
        if self.inner.steps.is_empty() {
            tracing::warn!(task = %self.key(), "task has no steps");
        }
        Ok(Arc::clone(&self.inner).drive().await)
    }

    /// Submit `run(Null)` to the resolved executor and return immediately.
    pub fn start(&self) {
        let task = self.clone();
        self.inner.exec(
            async move {
                if let Err(err) = task.run(Value::Null).await {
                    tracing::debug!(error = %err, "task start skipped");
                }
            }
            .boxed(),
        );
    }

    /// Request a pause. The driver stops at its next suspension point.
    ///
    /// Returns false if the task already finished.
    pub fn suspend(&self) -> bool {
        let mut state = self.inner.lock_state();
        match state.status {
            TaskStatus::Paused => true,
            TaskStatus::OkStopped | TaskStatus::FailStopped => false,
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running => {
                self.inner.set_status(&mut state, TaskStatus::Paused);
                tracing::debug!(task = %self.key(), "pause requested");
                true
            }
        }
    }

    /// Resume a paused task.
    ///
    /// If the previous driver has not reached a suspension point yet, the
    /// pause is simply cancelled. A task paused before its first run goes
    /// back to `Pending`, leaving the start to its owner (the context's
    /// admission, or a later `run`). Otherwise a new driver is submitted,
    /// which replays completed steps and re-checks the parked step's
    /// condition.
    pub fn resume(&self) -> bool {
        let _gate = self.inner.gate.lock().expect("task gate lock poisoned");
        let dispatch = {
            let mut state = self.inner.lock_state();
            match state.status {
                TaskStatus::Running | TaskStatus::Ready => return true,
                TaskStatus::Pending | TaskStatus::OkStopped | TaskStatus::FailStopped => {
                    return false;
                }
                TaskStatus::Paused if state.driving => {
                    self.inner.set_status(&mut state, TaskStatus::Running);
                    false
                }
                TaskStatus::Paused if !state.released => {
                    self.inner.set_status(&mut state, TaskStatus::Pending);
                    false
                }
                TaskStatus::Paused => {
                    self.inner.set_status(&mut state, TaskStatus::Ready);
                    true
                }
            }
        };
        tracing::debug!(task = %self.key(), dispatch, "task resumed");
        self.inner.publish(TaskEvent::TaskResumed {
            context: self.inner.context_key().map(str::to_string),
            task: self.key().to_string(),
        });
        if dispatch {
            let inner = Arc::clone(&self.inner);
            self.inner.exec(
                async move {
                    inner.drive().await;
                }
                .boxed(),
            );
        }
        true
    }

    /// Wait until the task reaches a terminal status.
    pub async fn wait(&self) -> TaskStatus {
        self.wait_for(TaskStatus::is_terminal).await
    }

    /// Wait until the task status satisfies `pred`.
    pub async fn wait_for(&self, mut pred: impl FnMut(TaskStatus) -> bool) -> TaskStatus {
        let mut rx = self.inner.status_tx.subscribe();
        let status = match rx.wait_for(|s| pred(*s)).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("key", &self.key())
            .field("status", &self.status())
            .field("steps", &self.step_count())
            .field("completed", &self.completed_steps())
            .finish()
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let started = self
            .started_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{}, {} -> [startTime: {}, stepTotal: {}, completed: {}, status: {}]",
            self.inner.context_key().unwrap_or("-"),
            self.key(),
            started,
            self.step_count(),
            self.completed_steps(),
            self.status(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
