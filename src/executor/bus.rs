//! In-process lifecycle event bus.
//!
//! Subscribers are plain callbacks on an explicit list; emission iterates
//! them synchronously in registration order, so for one emitter the event
//! order matches the order the engine produced them. A panicking
//! subscriber is isolated and logged so it cannot abort delivery to the
//! rest.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::core::ExecutionStatus;

/// Everything externally observable about the engine's lifecycle.
///
/// `ExecutionUpdated` fires after every transitional or terminal
/// persistence and is the preferred synchronization point for observers;
/// it is more reliable than polling the document store.
#[derive(Debug, Clone)]
pub enum WorchEvent {
    /// Startup handshake completed.
    Ready,
    /// A store failed during engine bookkeeping.
    Error { message: String },
    ExecutionStart {
        execution_id: String,
        event_name: String,
        attempt_count: u32,
    },
    /// Fires after both store writes for the terminal state settled.
    ExecutionComplete {
        execution_id: String,
        result: Value,
    },
    ExecutionFailed {
        execution_id: String,
        error: String,
        attempt_count: u32,
        will_retry: bool,
    },
    ExecutionUpdated {
        execution_id: String,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
        attempt_count: Option<u32>,
    },
    StepComplete {
        execution_id: String,
        step_name: String,
    },
    LeaderAcquired,
    LeaderLost,
    ScheduleRegistered {
        function_id: String,
    },
    ScheduleTriggered {
        function_id: String,
        execution_id: String,
        timestamp: i64,
        is_missed: bool,
    },
    ScheduleMissed {
        function_id: String,
    },
    Stopped,
}

type Subscriber = Arc<dyn Fn(&WorchEvent) + Send + Sync>;

/// Cloneable handle onto one subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback invoked synchronously on every emission.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&WorchEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .expect("subscriber list poisoned")
            .push(Arc::new(subscriber));
    }

    /// Registers a channel-backed subscriber and returns its receiver.
    ///
    /// The convenient form for tests and external observers that want to
    /// await events instead of being called back.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<WorchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Delivers `event` to every subscriber, best-effort.
    pub fn emit(&self, event: WorchEvent) {
        let subscribers = self
            .subscribers
            .read()
            .expect("subscriber list poisoned")
            .clone();
        for subscriber in &subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                warn!("event subscriber panicked; continuing emission");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.subscribers.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("subscribers", &count).finish()
    }
}
