//! Broadcast bus for task and context lifecycle events.
//!
//! Built on `tokio::sync::broadcast`. Subscribers pick an [`EventScope`] so a
//! listener for one context (or one task) does not have to filter the
//! traffic of every other context sharing the bus. Publishing with no
//! active subscribers is a no-op.

use tasklane_types::event::TaskEvent;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Which events a [`Subscription`] receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    All,
    /// Events of one context, including its tasks.
    Context(String),
    /// Events about one task, by key.
    Task(String),
}

impl EventScope {
    pub fn matches(&self, event: &TaskEvent) -> bool {
        match self {
            Self::All => true,
            Self::Context(key) => event.context_key() == Some(key.as_str()),
            Self::Task(key) => event.task_key() == Some(key.as_str()),
        }
    }
}

/// Receiving end of the bus, filtered to one scope.
///
/// A subscriber that falls behind skips the overwritten events and keeps
/// going; [`missed`](Subscription::missed) reports how many were lost.
pub struct Subscription {
    receiver: broadcast::Receiver<TaskEvent>,
    scope: EventScope,
    missed: u64,
}

impl Subscription {
    /// Wait for the next event in scope. `None` once every bus handle has
    /// been dropped.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.scope.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => self.lagged(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event in scope, without waiting.
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.scope.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(missed)) => self.lagged(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn scope(&self) -> &EventScope {
        &self.scope
    }

    /// Events dropped because this subscriber lagged behind the channel.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn lagged(&mut self, missed: u64) {
        self.missed += missed;
        tracing::warn!(scope = ?self.scope, missed, "event subscriber lagged");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("scope", &self.scope)
            .field("missed", &self.missed)
            .finish()
    }
}

/// Multi-consumer bus for task and context lifecycle events.
///
/// Cloning the bus clones the sender, so one bus can be shared by several
/// contexts and standalone tasks.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Every future event on the bus.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_scoped(EventScope::All)
    }

    /// Future events of the context with the given key.
    pub fn subscribe_context(&self, key: impl Into<String>) -> Subscription {
        self.subscribe_scoped(EventScope::Context(key.into()))
    }

    /// Future events about the task with the given key.
    pub fn subscribe_task(&self, key: impl Into<String>) -> Subscription {
        self.subscribe_scoped(EventScope::Task(key.into()))
    }

    pub fn subscribe_scoped(&self, scope: EventScope) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            scope,
            missed: 0,
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
