//! Task lifecycle events and the publish/subscribe bus that carries them.
//!
//! Handlers run synchronously on the publishing task, in registration order.
//! A panicking handler is logged and skipped; delivery continues with the
//! next one.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

use crate::core::{PlanId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::TaskStarted => write!(f, "TASK_STARTED"),
            EventType::TaskCompleted => write!(f, "TASK_COMPLETED"),
            EventType::TaskFailed => write!(f, "TASK_FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub plan_id: PlanId,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl ExecutionEvent {
    pub fn new(event_type: EventType, plan_id: PlanId, task_id: TaskId, payload: Value) -> Self {
        Self {
            event_type,
            plan_id,
            task_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn started(plan_id: PlanId, task_id: TaskId, payload: Value) -> Self {
        Self::new(EventType::TaskStarted, plan_id, task_id, payload)
    }

    pub fn completed(plan_id: PlanId, task_id: TaskId, payload: Value) -> Self {
        Self::new(EventType::TaskCompleted, plan_id, task_id, payload)
    }

    pub fn failed(plan_id: PlanId, task_id: TaskId, payload: Value) -> Self {
        Self::new(EventType::TaskFailed, plan_id, task_id, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type EventHandler = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
    /// `None` receives every event type.
    filter: Option<Vec<EventType>>,
}

impl Subscription {
    fn wants(&self, event_type: EventType) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |types| types.contains(&event_type))
    }
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, optionally limited to `event_types`.
    pub fn subscribe<F>(&self, handler: F, event_types: Option<Vec<EventType>>) -> SubscriptionId
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscription {
                id,
                handler: Arc::new(handler),
                filter: event_types,
            });
        id
    }

    /// Forward matching events into an unbounded channel.
    ///
    /// The subscription stays registered until `unsubscribe` is called;
    /// events published after the receiver is dropped are discarded.
    pub fn subscribe_channel(
        &self,
        event_types: Option<Vec<EventType>>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(
            move |event| {
                let _ = tx.send(event.clone());
            },
            event_types,
        );
        (id, rx)
    }

    /// Remove a handler. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver `event` to every matching handler. Returns how many handlers
    /// ran to completion.
    pub fn publish(&self, event: &ExecutionEvent) -> usize {
        let handlers: Vec<(SubscriptionId, EventHandler)> = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.wants(event.event_type))
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    subscription = %id,
                    event = %event.event_type,
                    task = %event.task_id,
                    "event handler panicked"
                ),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
