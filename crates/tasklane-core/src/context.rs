//! Task contexts: bounded-parallelism schedulers over a set of tasks.
//!
//! A [`TaskContext`] owns a FIFO waiting queue and an executing set whose
//! size never exceeds the configured parallel limit. Every state change
//! (start, add, finish, suspend, resume, stop) funnels through one
//! `trigger` pass that admits waiting tasks, cascades pause/resume to the
//! executing set, and detects completion.
//!
//! Tasks share data through the context's attribute map, and may wake each
//! other with [`TaskContext::resume_task`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tasklane_types::config::ContextConfig;
use tasklane_types::error::ContextError;
use tasklane_types::event::TaskEvent;
use tasklane_types::status::{ContextStatus, TaskStatus};
use tasklane_types::summary::ContextSummary;
use tokio::sync::watch;
use tracing::Span;
use uuid::Uuid;

use crate::event::EventBus;
use crate::executor::{ExecutorRef, Job, TokioExecutor};
use crate::task::{Task, TaskInner};

/// Parallel limit used when none is configured.
pub const DEFAULT_PARALLEL_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// TaskContextBuilder
// ---------------------------------------------------------------------------

pub struct TaskContextBuilder {
    key: String,
    parallel_limit: usize,
    task_timeout: Option<Duration>,
    executor: Option<ExecutorRef>,
    owns_executor: bool,
    events: Option<EventBus>,
    span: Option<Span>,
}

impl TaskContextBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
            task_timeout: None,
            executor: None,
            owns_executor: false,
            events: None,
            span: None,
        }
    }

    /// Maximum number of tasks in the executing set. Zero is raised to one.
    pub fn parallel_limit(mut self, limit: usize) -> Self {
        self.parallel_limit = limit;
        self
    }

    /// Default soft deadline for tasks that do not set their own.
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Apply the `[context]` section of the engine configuration.
    pub fn config(mut self, config: &ContextConfig) -> Self {
        self.parallel_limit = config.parallel_limit;
        self.task_timeout = config.task_timeout_secs.map(Duration::from_secs);
        self
    }

    pub fn executor(mut self, executor: ExecutorRef) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Shut the executor down when the context finishes.
    pub fn owns_executor(mut self, owns: bool) -> Self {
        self.owns_executor = owns;
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> TaskContext {
        let key = if self.key.is_empty() {
            format!("context-{}", Uuid::now_v7())
        } else {
            self.key
        };
        let parallel_limit = if self.parallel_limit == 0 {
            tracing::warn!(context = %key, "parallel limit of 0 raised to 1");
            1
        } else {
            self.parallel_limit
        };
        let (status_tx, _) = watch::channel(ContextStatus::Ready);

        TaskContext {
            inner: Arc::new(ContextInner {
                key,
                parallel_limit,
                task_timeout: self.task_timeout,
                state: Mutex::new(ContextState {
                    status: ContextStatus::Ready,
                    waiting: VecDeque::new(),
                    executing: Vec::new(),
                    succeeded: 0,
                    failed: 0,
                    discarded: 0,
                    started_at: None,
                    ended_at: None,
                    started: None,
                    elapsed: None,
                }),
                status_tx,
                attrs: DashMap::new(),
                executor: self.executor.unwrap_or_else(TokioExecutor::shared),
                owns_executor: self.owns_executor,
                events: self.events,
                span: self.span.unwrap_or_else(Span::current),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextInner
// ---------------------------------------------------------------------------

struct ContextState {
    status: ContextStatus,
    waiting: VecDeque<Task>,
    executing: Vec<Task>,
    succeeded: u64,
    failed: u64,
    discarded: u64,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    /// Frozen once the context finishes.
    elapsed: Option<Duration>,
}

impl ContextState {
    fn elapsed(&self) -> Duration {
        self.elapsed
            .or_else(|| self.started.map(|s| s.elapsed()))
            .unwrap_or_default()
    }
}

pub(crate) struct ContextInner {
    key: String,
    parallel_limit: usize,
    task_timeout: Option<Duration>,
    state: Mutex<ContextState>,
    status_tx: watch::Sender<ContextStatus>,
    attrs: DashMap<String, Value>,
    executor: ExecutorRef,
    owns_executor: bool,
    events: Option<EventBus>,
    span: Span,
}

/// Work collected under the state lock and carried out after releasing it.
#[derive(Default)]
struct TriggerPlan {
    admitted: Vec<Task>,
    suspend: Vec<Task>,
    resume: Vec<Task>,
    discarded: usize,
    finished: Option<ContextSummary>,
}

impl ContextInner {
    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().expect("context state lock poisoned")
    }

    fn set_status(&self, state: &mut ContextState, status: ContextStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    pub(crate) fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout
    }

    pub(crate) fn submit(&self, job: Job) {
        self.executor.submit(job);
    }

    pub(crate) fn publish(&self, event: TaskEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    fn snapshot(&self, state: &ContextState) -> ContextSummary {
        let timed_out = state
            .executing
            .iter()
            .filter(|t| t.is_timed_out())
            .map(|t| t.key().to_string())
            .collect();
        ContextSummary {
            key: self.key.clone(),
            status: state.status,
            succeeded: state.succeeded,
            failed: state.failed,
            discarded: state.discarded,
            waiting: state.waiting.len(),
            executing: state.executing.len(),
            timed_out,
            started_at: state.started_at,
            ended_at: state.ended_at,
            elapsed_ms: state.elapsed().as_millis() as u64,
        }
    }

    /// Mark the context finished once both the queue and the executing set
    /// are empty.
    fn check_completion(&self, state: &mut ContextState) -> Option<ContextSummary> {
        if !state.waiting.is_empty() || !state.executing.is_empty() {
            return None;
        }
        if !matches!(state.status, ContextStatus::Running | ContextStatus::Stopping) {
            return None;
        }
        let status = if state.failed == 0 {
            ContextStatus::OkStopped
        } else {
            ContextStatus::FailStopped
        };
        self.finish_locked(state, status);
        Some(self.snapshot(state))
    }

    fn finish_locked(&self, state: &mut ContextState, status: ContextStatus) {
        state.ended_at = Some(Utc::now());
        state.elapsed = Some(state.elapsed());
        self.set_status(state, status);
    }

    /// One scheduling pass.
    pub(crate) fn trigger(self: &Arc<Self>) {
        let plan = {
            let mut state = self.lock_state();
            let mut plan = TriggerPlan::default();
            match state.status {
                ContextStatus::Running => {
                    while state.executing.len() < self.parallel_limit {
                        let Some(task) = state.waiting.pop_front() else {
                            break;
                        };
                        state.executing.push(task.clone());
                        plan.admitted.push(task);
                    }
                }
                ContextStatus::Paused => plan.suspend = state.executing.clone(),
                ContextStatus::Stopping => {
                    plan.discarded = state.waiting.len();
                    state.discarded += plan.discarded as u64;
                    state.waiting.clear();
                    plan.resume = state.executing.clone();
                }
                _ => {}
            }
            plan.finished = self.check_completion(&mut state);
            plan
        };
        self.carry_out(plan);
    }

    fn carry_out(self: &Arc<Self>, plan: TriggerPlan) {
        if plan.discarded > 0 {
            tracing::warn!(context = %self.key, discarded = plan.discarded, "discarding waiting tasks on stop");
        }
        for task in plan.admitted {
            tracing::debug!(context = %self.key, task = %task.key(), "admitting task");
            self.publish(TaskEvent::TaskAdmitted {
                context: self.key.clone(),
                task: task.key().to_string(),
            });
            let ctx = Arc::clone(self);
            self.submit(
                async move {
                    if let Err(err) = task.run(Value::Null).await {
                        // Already finished outside the scheduler: release its slot.
                        if task.status().is_terminal() {
                            ctx.remove_task(task.inner());
                        } else {
                            tracing::debug!(error = %err, "admitted task already driven");
                        }
                    }
                }
                .boxed(),
            );
        }
        for task in plan.suspend {
            task.suspend();
        }
        for task in plan.resume {
            if task.status() == TaskStatus::Paused {
                task.resume();
            }
        }
        if let Some(summary) = plan.finished {
            self.on_finished(summary);
        }
    }

    fn on_finished(&self, summary: ContextSummary) {
        tracing::info!(
            parent: &self.span,
            context = %self.key,
            status = %summary.status,
            succeeded = summary.succeeded,
            failed = summary.failed,
            discarded = summary.discarded,
            elapsed_ms = summary.elapsed_ms,
            "context finished"
        );
        self.publish(TaskEvent::ContextFinished {
            context: self.key.clone(),
            status: summary.status,
            succeeded: summary.succeeded,
            failed: summary.failed,
            discarded: summary.discarded,
            duration_ms: summary.elapsed_ms,
        });
        if self.owns_executor {
            self.executor.shutdown();
        }
    }

    /// Release a finished task's slot, count its outcome and re-run the
    /// scheduler. Tasks the context does not hold are ignored.
    pub(crate) fn remove_task(self: &Arc<Self>, task: &Arc<TaskInner>) {
        let success = task.status() == TaskStatus::OkStopped;
        {
            let mut state = self.lock_state();
            let removed = if let Some(pos) = state
                .executing
                .iter()
                .position(|t| Arc::ptr_eq(t.inner(), task))
            {
                state.executing.remove(pos);
                true
            } else if let Some(pos) = state
                .waiting
                .iter()
                .position(|t| Arc::ptr_eq(t.inner(), task))
            {
                state.waiting.remove(pos);
                true
            } else {
                false
            };
            if !removed {
                tracing::trace!(context = %self.key, task = %task.key(), "finished task not tracked");
                return;
            }
            if success {
                state.succeeded += 1;
            } else {
                state.failed += 1;
            }
        }
        tracing::trace!(context = %self.key, task = %task.key(), success, "task removed");
        self.trigger();
    }
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// A cheaply clonable handle to a task context.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    /// Context with default settings on the ambient tokio runtime. An empty
    /// key is replaced with a generated one.
    pub fn new(key: impl Into<String>) -> Self {
        TaskContextBuilder::new(key).build()
    }

    pub fn builder(key: impl Into<String>) -> TaskContextBuilder {
        TaskContextBuilder::new(key)
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn status(&self) -> ContextStatus {
        self.inner.lock_state().status
    }

    pub fn parallel_limit(&self) -> usize {
        self.inner.parallel_limit
    }

    pub fn waiting_len(&self) -> usize {
        self.inner.lock_state().waiting.len()
    }

    pub fn executing_len(&self) -> usize {
        self.inner.lock_state().executing.len()
    }

    /// Queue a task. It runs once the context is started and a slot is free.
    ///
    /// Tasks may be added from inside a running step; the context then does
    /// not finish before the new task does.
    pub fn add_task(&self, task: impl Into<Task>) -> Result<(), ContextError> {
        let task = task.into();
        let task_status = task.status();
        if task_status != TaskStatus::Pending {
            return Err(ContextError::TaskAlreadyStarted {
                task: task.key().to_string(),
                status: task_status,
            });
        }

        {
            let mut state = self.inner.lock_state();
            match state.status {
                status if status.is_terminal() => {
                    return Err(ContextError::Terminated {
                        context: self.key().to_string(),
                        task: task.key().to_string(),
                        status,
                    });
                }
                ContextStatus::Stopping => {
                    return Err(ContextError::Stopping {
                        context: self.key().to_string(),
                        task: task.key().to_string(),
                    });
                }
                _ => {}
            }
            task.inner()
                .bind_context(self.key(), Arc::downgrade(&self.inner))
                .map_err(|owner| ContextError::TaskAlreadyOwned {
                    task: task.key().to_string(),
                    owner,
                })?;
            state.waiting.push_back(task.clone());
        }

        tracing::debug!(context = %self.key(), task = %task.key(), "task queued");
        self.inner.trigger();
        Ok(())
    }

    /// Begin admitting tasks. Only the first call has an effect.
    ///
    /// A context started with nothing queued finishes immediately as
    /// `OkStopped`, not `FailStopped`: an empty run is a successful no-op.
    pub fn start(&self) {
        let (waiting, finished) = {
            let mut state = self.inner.lock_state();
            match state.status {
                ContextStatus::Ready => {}
                status => {
                    tracing::warn!(context = %self.key(), %status, "context already started, ignoring start");
                    return;
                }
            }
            state.started_at = Some(Utc::now());
            state.started = Some(Instant::now());
            if state.waiting.is_empty() {
                tracing::warn!(context = %self.key(), "no tasks queued, stopping context");
                self.inner.finish_locked(&mut state, ContextStatus::OkStopped);
                (0, Some(self.inner.snapshot(&state)))
            } else {
                self.inner.set_status(&mut state, ContextStatus::Running);
                (state.waiting.len(), None)
            }
        };

        if let Some(summary) = finished {
            self.inner.on_finished(summary);
            return;
        }
        tracing::info!(
            parent: &self.inner.span,
            context = %self.key(),
            waiting,
            parallel_limit = self.inner.parallel_limit,
            "context started"
        );
        self.inner.publish(TaskEvent::ContextStarted {
            context: self.key().to_string(),
            waiting,
        });
        self.inner.trigger();
    }

    /// Stop admitting tasks, drop the waiting queue and let executing tasks
    /// finish. Paused tasks are resumed so they can run to completion.
    pub fn stop(&self) -> bool {
        {
            let mut state = self.inner.lock_state();
            match state.status {
                ContextStatus::Stopping => return true,
                ContextStatus::Running | ContextStatus::Paused => {
                    self.inner.set_status(&mut state, ContextStatus::Stopping);
                }
                _ => return false,
            }
        }
        tracing::info!(context = %self.key(), "context stopping");
        self.inner.trigger();
        true
    }

    /// Pause admission and every executing task.
    pub fn suspend(&self) -> bool {
        {
            let mut state = self.inner.lock_state();
            match state.status {
                ContextStatus::Paused => return true,
                ContextStatus::Running => {
                    self.inner.set_status(&mut state, ContextStatus::Paused);
                }
                status => {
                    tracing::warn!(context = %self.key(), %status, "cannot suspend context");
                    return false;
                }
            }
        }
        tracing::info!(context = %self.key(), "context suspended");
        self.inner.trigger();
        true
    }

    /// Resume admission and every paused executing task.
    pub fn resume(&self) -> bool {
        let paused = {
            let mut state = self.inner.lock_state();
            match state.status {
                ContextStatus::Running => return true,
                ContextStatus::Paused => {
                    self.inner.set_status(&mut state, ContextStatus::Running);
                    state.executing.clone()
                }
                status => {
                    tracing::warn!(context = %self.key(), %status, "cannot resume context");
                    return false;
                }
            }
        };
        tracing::info!(context = %self.key(), "context resumed");
        for task in paused {
            if task.status() == TaskStatus::Paused {
                task.resume();
            }
        }
        self.inner.trigger();
        true
    }

    /// Wake the executing task with the given key.
    ///
    /// The resume is handed to the executor; returns false when no executing
    /// task matches.
    pub fn resume_task(&self, key: &str) -> bool {
        let target = self
            .inner
            .lock_state()
            .executing
            .iter()
            .find(|t| t.key() == key)
            .cloned();
        match target {
            Some(task) => {
                tracing::debug!(context = %self.key(), task = %key, "resume requested");
                self.inner.submit(
                    async move {
                        task.resume();
                    }
                    .boxed(),
                );
                true
            }
            None => {
                tracing::debug!(context = %self.key(), task = %key, "no executing task to resume");
                false
            }
        }
    }

    /// Store a shared attribute, returning the previous value.
    pub fn set_attr(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.inner.attrs.insert(key.into(), value.into())
    }

    pub fn get_attr(&self, key: &str) -> Option<Value> {
        self.inner.attrs.get(key).map(|v| v.value().clone())
    }

    pub fn remove_attr(&self, key: &str) -> Option<Value> {
        self.inner.attrs.remove(key).map(|(_, v)| v)
    }

    pub fn attr_keys(&self) -> Vec<String> {
        self.inner.attrs.iter().map(|e| e.key().clone()).collect()
    }

    /// Point-in-time view of counters and queue sizes.
    pub fn summary(&self) -> ContextSummary {
        let state = self.inner.lock_state();
        self.inner.snapshot(&state)
    }

    /// Wait until the context reaches a terminal status.
    pub async fn wait(&self) -> ContextStatus {
        let mut rx = self.inner.status_tx.subscribe();
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// Start the context and wait for it to finish.
    pub async fn run(&self) -> ContextSummary {
        self.start();
        self.wait().await;
        self.summary()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("key", &self.key())
            .field("status", &self.status())
            .field("parallel_limit", &self.parallel_limit())
            .finish()
    }
}

impl std::fmt::Display for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.summary())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepHandle;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn noop(key: &str) -> Task {
        Task::builder(key).step(|_, _| async { Ok(Value::Null) }).build()
    }

    #[tokio::test]
    async fn runs_all_tasks_and_counts_outcomes() {
        let ctx = TaskContext::new("mixed");
        ctx.add_task(noop("a")).unwrap();
        ctx.add_task(noop("b")).unwrap();
        ctx.add_task(
            Task::builder("c").step(|_, _| async { Err(anyhow::anyhow!("nope")) }),
        )
        .unwrap();

        let summary = timeout(WAIT, ctx.run()).await.unwrap();
        assert_eq!(summary.status, ContextStatus::FailStopped);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.finished(), 3);
        assert_eq!(summary.waiting, 0);
        assert_eq!(summary.executing, 0);
        assert!(summary.ended_at.is_some());
    }

    #[tokio::test]
    async fn empty_context_finishes_ok_on_start() {
        let ctx = TaskContext::new("idle");
        ctx.start();
        assert_eq!(ctx.status(), ContextStatus::OkStopped);
        assert_eq!(timeout(WAIT, ctx.wait()).await.unwrap(), ContextStatus::OkStopped);
    }

    #[tokio::test]
    async fn empty_key_is_generated() {
        let ctx = TaskContext::new("");
        assert!(ctx.key().starts_with("context-"));
    }

    #[test]
    fn zero_parallel_limit_is_raised_to_one() {
        let ctx = TaskContext::builder("narrow").parallel_limit(0).build();
        assert_eq!(ctx.parallel_limit(), 1);
    }

    #[test]
    fn config_sets_limit_and_timeout() {
        let config = ContextConfig {
            parallel_limit: 3,
            task_timeout_secs: Some(30),
        };
        let ctx = TaskContext::builder("configured").config(&config).build();
        assert_eq!(ctx.parallel_limit(), 3);
        assert_eq!(ctx.inner.task_timeout(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn add_task_rejections() {
        let ctx = TaskContext::new("owner");
        let task = noop("shared");
        ctx.add_task(task.clone()).unwrap();

        let other = TaskContext::new("other");
        assert_eq!(
            other.add_task(task.clone()).unwrap_err(),
            ContextError::TaskAlreadyOwned {
                task: "shared".to_string(),
                owner: "owner".to_string(),
            }
        );

        let started = noop("started");
        started.run(Value::Null).await.unwrap();
        assert!(matches!(
            ctx.add_task(started).unwrap_err(),
            ContextError::TaskAlreadyStarted { status: TaskStatus::OkStopped, .. }
        ));

        timeout(WAIT, ctx.run()).await.unwrap();
        assert!(matches!(
            ctx.add_task(noop("late")).unwrap_err(),
            ContextError::Terminated { status: ContextStatus::OkStopped, .. }
        ));
    }

    #[tokio::test]
    async fn suspend_in_step_then_context_resume() {
        let ctx = TaskContext::new("scenario-a");
        let seen = Arc::new(Mutex::new(Value::Null));
        let record = Arc::clone(&seen);
        ctx.add_task(
            Task::builder("pausing")
                .step(|_, me| async move {
                    me.task().suspend();
                    Ok(json!("x"))
                })
                .step(move |input, _| {
                    let record = Arc::clone(&record);
                    async move {
                        *record.lock().unwrap() = input.clone();
                        Ok(input)
                    }
                }),
        )
        .unwrap();
        ctx.start();

        let task = ctx.inner.lock_state().executing[0].clone();
        timeout(WAIT, task.wait_for(|s| s == TaskStatus::Paused)).await.unwrap();
        assert_eq!(ctx.status(), ContextStatus::Running);

        assert!(ctx.resume_task("pausing"));
        assert_eq!(timeout(WAIT, ctx.wait()).await.unwrap(), ContextStatus::OkStopped);
        assert_eq!(*seen.lock().unwrap(), json!("x"));
    }

    #[tokio::test]
    async fn attribute_rendezvous_between_tasks() {
        let ctx = TaskContext::new("scenario-c");
        ctx.add_task(
            Task::builder("task1").step_when(
                |me: &StepHandle| me.get_attr("xxx").is_some(),
                |_, me| async move { Ok(me.get_attr("xxx").unwrap_or_default()) },
            ),
        )
        .unwrap();
        ctx.add_task(Task::builder("task2").step(|_, me| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            me.set_attr("xxx", "ooo");
            if let Some(ctx) = me.context() {
                ctx.resume_task("task1");
            }
            Ok(Value::Null)
        }))
        .unwrap();

        let task1 = ctx.inner.lock_state().waiting[0].clone();
        let summary = timeout(WAIT, ctx.run()).await.unwrap();
        assert_eq!(summary.status, ContextStatus::OkStopped);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(task1.output(), json!("ooo"));
        assert_eq!(ctx.get_attr("xxx"), Some(json!("ooo")));
    }

    #[tokio::test]
    async fn task_spawned_from_step_keeps_context_alive() {
        let ctx = TaskContext::new("scenario-d");
        let child_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&child_ran);

        ctx.add_task(Task::builder("parent").step(move |_, me| {
            let flag = Arc::clone(&flag);
            async move {
                let child = Task::builder("child").step(move |_, _| {
                    let flag = Arc::clone(&flag);
                    async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        flag.store(true, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                });
                me.context()
                    .ok_or_else(|| anyhow::anyhow!("no context"))?
                    .add_task(child)?;
                Ok(Value::Null)
            }
        }))
        .unwrap();

        let summary = timeout(WAIT, ctx.run()).await.unwrap();
        assert_eq!(summary.status, ContextStatus::OkStopped);
        assert_eq!(summary.succeeded, 2);
        assert!(child_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn resume_task_targets_only_matching_key() {
        let ctx = TaskContext::new("targeted");
        for key in ["left", "right"] {
            ctx.add_task(
                Task::builder(key).step_when(
                    |me: &StepHandle| me.get_attr("go").is_some(),
                    |_, _| async { Ok(Value::Null) },
                ),
            )
            .unwrap();
        }
        ctx.start();
        let (left, right) = {
            let state = ctx.inner.lock_state();
            (state.executing[0].clone(), state.executing[1].clone())
        };
        timeout(WAIT, left.wait_for(|s| s == TaskStatus::Paused)).await.unwrap();
        timeout(WAIT, right.wait_for(|s| s == TaskStatus::Paused)).await.unwrap();

        ctx.set_attr("go", true);
        assert!(ctx.resume_task("left"));
        assert!(!ctx.resume_task("missing"));
        assert_eq!(timeout(WAIT, left.wait()).await.unwrap(), TaskStatus::OkStopped);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(right.status(), TaskStatus::Paused);
        assert_eq!(ctx.status(), ContextStatus::Running);

        assert!(ctx.resume_task("right"));
        assert_eq!(timeout(WAIT, ctx.wait()).await.unwrap(), ContextStatus::OkStopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_limit_holds_under_concurrent_adds() {
        const LIMIT: usize = 3;
        let ctx = TaskContext::builder("bounded").parallel_limit(LIMIT).build();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let peak_executing = Arc::new(AtomicUsize::new(0));

        let make = |key: String| {
            let (running, peak, peak_executing) =
                (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&peak_executing));
            Task::builder(key).step(move |_, me| {
                let (running, peak, peak_executing) =
                    (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&peak_executing));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    if let Some(ctx) = me.context() {
                        peak_executing.fetch_max(ctx.executing_len(), Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
        };

        // An anchor keeps the context running while the bursts land.
        ctx.add_task(Task::builder("anchor").step(|_, _| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Value::Null)
        }))
        .unwrap();
        ctx.start();

        let mut bursts = Vec::new();
        for burst in 0..4 {
            let ctx = ctx.clone();
            let tasks: Vec<Task> = (0..25).map(|i| make(format!("t-{burst}-{i}")).build()).collect();
            bursts.push(tokio::spawn(async move {
                for task in tasks {
                    ctx.add_task(task).unwrap();
                }
            }));
        }
        for burst in bursts {
            burst.await.unwrap();
        }

        let status = timeout(WAIT, ctx.wait()).await.unwrap();
        assert_eq!(status, ContextStatus::OkStopped);
        assert_eq!(ctx.summary().succeeded, 101);
        assert!(peak.load(Ordering::SeqCst) <= LIMIT);
        assert!(peak_executing.load(Ordering::SeqCst) <= LIMIT);
    }

    #[tokio::test]
    async fn queued_task_paused_and_resumed_waits_for_admission() {
        let ctx = TaskContext::builder("single-slot").parallel_limit(1).build();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let make = |key: &str| {
            let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
            Task::builder(key)
                .step(move |_, _| {
                    let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                })
                .build()
        };

        let second = make("second");
        ctx.add_task(make("first")).unwrap();
        ctx.add_task(second.clone()).unwrap();
        ctx.start();

        assert!(second.suspend());
        assert!(second.resume());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(second.status(), TaskStatus::Pending);
        assert_eq!(ctx.waiting_len(), 1);
        assert_eq!(ctx.executing_len(), 1);

        assert_eq!(timeout(WAIT, ctx.wait()).await.unwrap(), ContextStatus::OkStopped);
        assert_eq!(ctx.summary().succeeded, 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn task_admitted_while_paused_runs_once_resumed() {
        let ctx = TaskContext::builder("deferred").parallel_limit(1).build();
        let first = Task::builder("first")
            .step(|_, _| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Value::Null)
            })
            .build();
        let second = Task::builder("second")
            .step(|_, _| async { Ok(json!("late")) })
            .build();
        ctx.add_task(first.clone()).unwrap();
        ctx.add_task(second.clone()).unwrap();
        ctx.start();
        assert!(second.suspend());

        assert_eq!(timeout(WAIT, first.wait()).await.unwrap(), TaskStatus::OkStopped);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.waiting_len(), 0);
        assert_eq!(ctx.executing_len(), 1);
        assert_eq!(second.status(), TaskStatus::Paused);
        assert_eq!(ctx.status(), ContextStatus::Running);

        assert!(ctx.resume_task("second"));
        assert_eq!(timeout(WAIT, ctx.wait()).await.unwrap(), ContextStatus::OkStopped);
        assert_eq!(second.output(), json!("late"));
        assert_eq!(ctx.summary().succeeded, 2);
    }

    #[tokio::test]
    async fn stop_resumes_paused_task_and_drains() {
        let ctx = TaskContext::new("drain");
        let task = Task::builder("self-pausing")
            .step(|_, me| async move {
                me.task().suspend();
                Ok(json!("x"))
            })
            .step(|input, _| async move { Ok(input) })
            .build();
        ctx.add_task(task.clone()).unwrap();
        ctx.start();

        timeout(WAIT, task.wait_for(|s| s == TaskStatus::Paused))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(task.status(), TaskStatus::Paused);
        assert_eq!(task.completed_steps(), 1);

        assert!(ctx.stop());
        assert_eq!(timeout(WAIT, ctx.wait()).await.unwrap(), ContextStatus::OkStopped);
        assert_eq!(task.status(), TaskStatus::OkStopped);
        assert_eq!(task.output(), json!("x"));
        assert_eq!(ctx.summary().succeeded, 1);
    }

    #[tokio::test]
    async fn stop_discards_waiting_and_lets_executing_finish() {
        let ctx = TaskContext::builder("stoppable").parallel_limit(1).build();
        ctx.add_task(Task::builder("first").step(|_, _| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(Value::Null)
        }))
        .unwrap();
        ctx.add_task(noop("second")).unwrap();
        ctx.add_task(noop("third")).unwrap();
        ctx.start();

        assert!(ctx.stop());
        assert!(ctx.stop());
        assert!(matches!(
            ctx.add_task(noop("rejected")).unwrap_err(),
            ContextError::Stopping { .. }
        ));

        assert_eq!(timeout(WAIT, ctx.wait()).await.unwrap(), ContextStatus::OkStopped);
        let summary = ctx.summary();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.discarded, 2);
        assert!(!ctx.stop());
    }

    #[tokio::test]
    async fn suspend_and_resume_cascade_to_tasks() {
        let ctx = TaskContext::builder("cascade").parallel_limit(2).build();
        let second_step = Arc::new(AtomicUsize::new(0));
        for key in ["one", "two"] {
            let counter = Arc::clone(&second_step);
            ctx.add_task(
                Task::builder(key)
                    .step(|_, _| async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(Value::Null)
                    })
                    .step(move |_, _| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(Value::Null)
                        }
                    }),
            )
            .unwrap();
        }
        ctx.add_task(noop("queued")).unwrap();
        ctx.start();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(ctx.suspend());
        assert_eq!(ctx.status(), ContextStatus::Paused);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(second_step.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.waiting_len(), 1);

        assert!(ctx.resume());
        assert_eq!(timeout(WAIT, ctx.wait()).await.unwrap(), ContextStatus::OkStopped);
        assert_eq!(second_step.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.summary().succeeded, 3);
    }

    #[tokio::test]
    async fn suspend_before_start_is_rejected() {
        let ctx = TaskContext::new("cold");
        assert!(!ctx.suspend());
        assert!(!ctx.resume());
        assert!(!ctx.stop());
    }

    #[tokio::test]
    async fn second_start_is_ignored() {
        let ctx = TaskContext::new("twice");
        ctx.add_task(noop("only")).unwrap();
        ctx.start();
        ctx.start();
        assert_eq!(timeout(WAIT, ctx.wait()).await.unwrap(), ContextStatus::OkStopped);
        assert_eq!(ctx.summary().succeeded, 1);
    }

    #[tokio::test]
    async fn attributes_round_trip() {
        let ctx = TaskContext::new("attrs");
        assert_eq!(ctx.set_attr("k", 1), None);
        assert_eq!(ctx.set_attr("k", 2), Some(json!(1)));
        assert_eq!(ctx.get_attr("k"), Some(json!(2)));
        assert_eq!(ctx.attr_keys(), vec!["k".to_string()]);
        assert_eq!(ctx.remove_attr("k"), Some(json!(2)));
        assert_eq!(ctx.get_attr("k"), None);
    }

    #[tokio::test]
    async fn context_events_bracket_the_run() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let ctx = TaskContext::builder("evented").event_bus(bus).build();
        ctx.add_task(noop("e1")).unwrap();
        timeout(WAIT, ctx.run()).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(TaskEvent::ContextStarted { waiting: 1, .. })));
        assert!(events.iter().any(|e| matches!(e, TaskEvent::TaskAdmitted { task, .. } if task == "e1")));
        assert!(events.iter().any(|e| matches!(e, TaskEvent::TaskFinished { task, .. } if task == "e1")));
        assert!(matches!(
            events.last(),
            Some(TaskEvent::ContextFinished { status: ContextStatus::OkStopped, succeeded: 1, .. })
        ));
    }

    #[tokio::test]
    async fn task_display_includes_context_key() {
        let ctx = TaskContext::new("shown");
        let task = noop("listed");
        ctx.add_task(task.clone()).unwrap();
        assert!(task.to_string().starts_with("shown, listed"));
        assert_eq!(task.context().map(|c| c.key().to_string()), Some("shown".to_string()));
    }
}
