//! Producer-side client: event submission and manual retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::core::{now_millis, Event, Execution, ExecutionStatus};
use crate::storage::{DocStore, ExecutionUpdate, KeySpace, KvStore};

use super::bus::{EventBus, WorchEvent};
use super::error::{ExecutionError, Result};

/// Submits events into the engine.
///
/// The client owns the initial write of every execution record: both
/// stores are written in parallel and only then is the id appended to the
/// queue, so a worker can never pop an id whose record is missing.
pub struct Client {
    kv: Arc<dyn KvStore>,
    doc: Arc<dyn DocStore>,
    keys: KeySpace,
    bus: EventBus,
    ready: AtomicBool,
}

impl Client {
    /// Creates a client that is not yet ready; call [`Client::connect`]
    /// before submitting.
    pub fn new(kv: Arc<dyn KvStore>, doc: Arc<dyn DocStore>, queue_prefix: &str) -> Self {
        Self {
            kv,
            doc,
            keys: KeySpace::new(queue_prefix),
            bus: EventBus::new(),
            ready: AtomicBool::new(false),
        }
    }

    /// Replaces the bus so client lifecycle events land on a shared one.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Handshakes with both stores and bootstraps indexes.
    pub async fn connect(&self) -> Result<()> {
        let (kv_ping, doc_ping) = tokio::join!(self.kv.ping(), self.doc.ping());
        kv_ping?;
        doc_ping?;
        self.doc.ensure_indexes().await?;
        self.ready.store(true, Ordering::SeqCst);
        self.bus.emit(WorchEvent::Ready);
        info!("client connected");
        Ok(())
    }

    fn require_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ExecutionError::NotReady)
        }
    }

    /// Submits an event and returns its execution id.
    ///
    /// A missing id is generated (random 128-bit, hex); a caller-supplied
    /// timestamp becomes the execution's `created_at`.
    pub async fn submit(&self, event: Event) -> Result<String> {
        self.require_ready()?;

        let id = event
            .id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let now = now_millis();
        let created_at = event.timestamp.unwrap_or(now);
        let data = serde_json::to_string(&event.data)
            .map_err(crate::core::CoreError::Serialization)?;

        let mut execution = Execution::queued(id.clone(), event.name, data, created_at);
        execution.updated_at = now;

        let execution_key = self.keys.execution(&id);
        let kv_fields = execution.to_kv_fields();
        let (kv_write, doc_write) = tokio::join!(
            self.kv.hash_set(&execution_key, &kv_fields),
            self.doc.insert_execution(&execution),
        );
        kv_write?;
        doc_write?;

        self.kv.list_push_right(&self.keys.queue(), &id).await?;
        debug!("submitted execution {} for {}", id, execution.event_name);
        Ok(id)
    }

    /// Forces an execution back onto the queue from any state.
    ///
    /// Resets `attempt_count` to zero, clears the error fields in both
    /// stores and enqueues the id. Deliberately does not inspect the
    /// current status; operators use this to re-drive anything.
    pub async fn manual_retry(&self, id: &str) -> Result<()> {
        self.require_ready()?;
        let now = now_millis();

        let kv_fields = [
            ("status".to_string(), ExecutionStatus::Queued.as_str().to_string()),
            ("attemptCount".to_string(), "0".to_string()),
            ("error".to_string(), String::new()),
            ("errorStack".to_string(), String::new()),
            ("updatedAt".to_string(), now.to_string()),
        ];
        let mut update = ExecutionUpdate::status(ExecutionStatus::Queued, now);
        update.attempt_count = Some(0);
        update.clear_errors = true;

        let execution_key = self.keys.execution(id);
        let (kv_write, doc_write) = tokio::join!(
            self.kv.hash_set(&execution_key, &kv_fields),
            self.doc.update_execution(id, update),
        );
        kv_write?;
        doc_write?;

        self.kv.list_push_right(&self.keys.queue(), id).await?;
        info!("manually retried execution {}", id);
        Ok(())
    }
}
