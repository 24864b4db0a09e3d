//! The worker pool (`Worcher`): dequeue loops, handler invocation,
//! status transitions, retry policy and orphan recovery.
//!
//! Connection policy: execution metadata always goes through the shared
//! KV adapter the pool was built with. Each dequeue loop owns a duplicate
//! used only for the blocking pop, and each active execution duplicates
//! its own connection for step cache traffic, so a pop waiting out its
//! timeout can never stall an unrelated update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::core::{now_millis, Execution, ExecutionStatus};
use crate::storage::{DocStore, ExecutionFilter, ExecutionUpdate, KeySpace, KvStore};

use super::bus::{EventBus, WorchEvent};
use super::error::{ExecutionError, Result};
use super::handler::{Handler, HandlerContext, HandlerEvent};
use super::step::StepRunner;

/// How long one blocking pop waits before re-checking the run flag.
const POP_TIMEOUT: Duration = Duration::from_secs(5);

/// Granularity of the stop-drain poll.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// A pool of dequeue workers executing registered handlers.
pub struct Worcher {
    kv: Arc<dyn KvStore>,
    doc: Arc<dyn DocStore>,
    handlers: Arc<HashMap<String, Handler>>,
    concurrency: usize,
    keys: KeySpace,
    bus: EventBus,
    ready: AtomicBool,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    worker_handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Worcher {
    /// Builds a pool over the given stores and handler list.
    ///
    /// Two handlers sharing an event name are a construction error; the
    /// registry must be unambiguous before anything runs.
    pub fn new(
        kv: Arc<dyn KvStore>,
        doc: Arc<dyn DocStore>,
        handlers: Vec<Handler>,
        concurrency: usize,
        queue_prefix: &str,
    ) -> Result<Self> {
        let mut registry = HashMap::new();
        for handler in handlers {
            let id = handler.id().to_string();
            if registry.insert(id.clone(), handler).is_some() {
                return Err(ExecutionError::DuplicateHandler(id));
            }
        }

        Ok(Self {
            kv,
            doc,
            handlers: Arc::new(registry),
            concurrency: concurrency.max(1),
            keys: KeySpace::new(queue_prefix),
            bus: EventBus::new(),
            ready: AtomicBool::new(false),
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            worker_handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Replaces the bus so pool lifecycle events land on a shared one.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Startup handshake: ping both stores, bootstrap indexes, emit `ready`.
    pub async fn connect(&self) -> Result<()> {
        let (kv_ping, doc_ping) = tokio::join!(self.kv.ping(), self.doc.ping());
        kv_ping?;
        doc_ping?;
        self.doc.ensure_indexes().await?;
        self.ready.store(true, Ordering::SeqCst);
        self.bus.emit(WorchEvent::Ready);
        info!(
            "worker pool ready: {} handlers, concurrency {}",
            self.handlers.len(),
            self.concurrency
        );
        Ok(())
    }

    /// Recovers orphans, then spawns the dequeue loops.
    pub async fn start(&self) -> Result<()> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(ExecutionError::NotReady);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ExecutionError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);

        self.recover_orphans().await?;

        let mut handles = self.worker_handles.lock().await;
        for worker_index in 0..self.concurrency {
            let task = ExecutionTask {
                kv: Arc::clone(&self.kv),
                doc: Arc::clone(&self.doc),
                handlers: Arc::clone(&self.handlers),
                keys: self.keys.clone(),
                bus: self.bus.clone(),
                running: Arc::clone(&self.running),
                in_flight: Arc::clone(&self.in_flight),
            };
            handles.push(tokio::spawn(worker_loop(worker_index, task)));
        }
        info!("worker pool started with {} workers", self.concurrency);
        Ok(())
    }

    /// Gracefully drains the pool.
    ///
    /// Running handlers are never cancelled; the pool stops popping, then
    /// waits for the in-flight count to reach zero before the workers
    /// release their queue connections. Pending retry re-enqueues are
    /// dropped once the run flag is down.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ExecutionError::NotRunning);
        }

        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
        Ok(())
    }

    /// Re-enqueues everything a crashed worker left in flight.
    ///
    /// Runs once per `start()`, before the dequeue loops exist. Two pools
    /// racing the same orphan may double-enqueue it; the duplicate run is
    /// idempotent through step memoization.
    async fn recover_orphans(&self) -> Result<()> {
        let orphans = self.doc.list_executions(ExecutionFilter::in_flight()).await?;
        if orphans.is_empty() {
            return Ok(());
        }
        info!("recovering {} orphaned executions", orphans.len());

        for orphan in orphans {
            let now = now_millis();
            let mut requeued = orphan.clone();
            requeued.status = ExecutionStatus::Queued;
            requeued.updated_at = now;

            self.kv
                .hash_set(&self.keys.execution(&orphan.id), &requeued.to_kv_fields())
                .await?;
            self.doc
                .update_execution(&orphan.id, ExecutionUpdate::status(ExecutionStatus::Queued, now))
                .await?;
            self.kv
                .list_push_right(&self.keys.queue(), &orphan.id)
                .await?;
            debug!("re-enqueued orphan {}", orphan.id);
        }
        Ok(())
    }
}

/// One dequeue loop: pop on a dedicated connection, hand executions to
/// concurrent tasks, drain before disconnecting.
///
/// Stop is observed between iterations; the pop timeout bounds how long
/// that takes. A value popped in the same iteration the flag went down
/// is still processed, never dropped.
async fn worker_loop(worker_index: usize, task: ExecutionTask) {
    let conn = match task.kv.duplicate().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("worker {} failed to open queue connection: {}", worker_index, e);
            task.bus.emit(WorchEvent::Error {
                message: format!("worker {} queue connection: {}", worker_index, e),
            });
            return;
        }
    };
    let queue = task.keys.queue();
    let mut active: JoinSet<()> = JoinSet::new();

    while task.running.load(Ordering::SeqCst) {
        let popped = conn.list_pop_left_blocking(&queue, POP_TIMEOUT).await;

        // Reap finished executions without blocking the pop loop.
        while let Some(reaped) = active.try_join_next() {
            if let Err(e) = reaped {
                error!("worker {} execution task failed: {}", worker_index, e);
            }
        }

        match popped {
            Ok(Some(id)) => {
                // Spawn so the next pop happens immediately; throughput
                // must not wait on handler latency.
                task.in_flight.fetch_add(1, Ordering::SeqCst);
                let task = task.clone();
                active.spawn(async move {
                    let in_flight = Arc::clone(&task.in_flight);
                    let outcome = std::panic::AssertUnwindSafe(task.process(id))
                        .catch_unwind()
                        .await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    if outcome.is_err() {
                        error!("execution task panicked");
                    }
                });
            }
            Ok(None) => {
                // Pop timeout; loop around and re-check the run flag.
            }
            Err(e) => {
                warn!("worker {} dequeue failed: {}", worker_index, e);
                task.bus.emit(WorchEvent::Error {
                    message: format!("dequeue failed: {}", e),
                });
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    // Outstanding executions finish before the connection goes away;
    // disconnecting earlier would strand their final updates.
    while active.join_next().await.is_some() {}
    if let Err(e) = conn.disconnect().await {
        warn!("worker {} disconnect failed: {}", worker_index, e);
    }
    debug!("worker {} exited", worker_index);
}

/// Shared context an execution runs against; cheap to clone into tasks.
#[derive(Clone)]
struct ExecutionTask {
    kv: Arc<dyn KvStore>,
    doc: Arc<dyn DocStore>,
    handlers: Arc<HashMap<String, Handler>>,
    keys: KeySpace,
    bus: EventBus,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl ExecutionTask {
    async fn process(self, id: String) {
        // 1. Load and validate the KV record.
        let fields = match self.kv.hash_get_all(&self.keys.execution(&id)).await {
            Ok(fields) => fields,
            Err(e) => {
                self.emit_store_error(&id, "loading execution", &e.to_string());
                return;
            }
        };
        let execution = match Execution::from_kv_fields(&id, &fields) {
            Ok(execution) => execution,
            Err(e) => {
                let reason = ExecutionError::MalformedRecord {
                    id: id.clone(),
                    reason: e.to_string(),
                };
                self.fail_without_retry(&id, reason.to_string()).await;
                return;
            }
        };

        // 2. Parse the payload and resolve the handler.
        let data: Value = match serde_json::from_str(&execution.event_data) {
            Ok(data) => data,
            Err(e) => {
                let reason = ExecutionError::MalformedPayload {
                    id: id.clone(),
                    reason: e.to_string(),
                };
                self.fail_without_retry(&id, reason.to_string()).await;
                return;
            }
        };
        let Some(handler) = self.handlers.get(&execution.event_name).cloned() else {
            let reason = ExecutionError::UnknownHandler(execution.event_name.clone());
            self.fail_without_retry(&id, reason.to_string()).await;
            return;
        };

        // 3. Transition to processing.
        let now = now_millis();
        let execution_key = self.keys.execution(&id);
        let kv_fields = [
            ("status".to_string(), ExecutionStatus::Processing.as_str().to_string()),
            ("updatedAt".to_string(), now.to_string()),
        ];
        let (kv_write, doc_write) = tokio::join!(
            self.kv.hash_set(&execution_key, &kv_fields),
            self.doc
                .update_execution(&id, ExecutionUpdate::status(ExecutionStatus::Processing, now)),
        );
        if let Err(e) = kv_write {
            self.emit_store_error(&id, "marking processing (kv)", &e.to_string());
            return;
        }
        if let Err(e) = doc_write {
            self.emit_store_error(&id, "marking processing (doc)", &e.to_string());
            return;
        }
        self.bus.emit(WorchEvent::ExecutionStart {
            execution_id: id.clone(),
            event_name: execution.event_name.clone(),
            attempt_count: execution.attempt_count,
        });

        // 4. Dedicated step connection for this execution.
        let step_conn = match self.kv.duplicate().await {
            Ok(conn) => conn,
            Err(e) => {
                self.emit_store_error(&id, "opening step connection", &e.to_string());
                return;
            }
        };
        let runner = StepRunner::new(
            id.clone(),
            Arc::clone(&step_conn),
            Arc::clone(&self.doc),
            &self.keys,
            self.bus.clone(),
        );

        // 5. Invoke the handler. A panic inside it is converted into a
        // failure so the step connection is still released and the retry
        // policy still applies.
        let context = HandlerContext {
            event: HandlerEvent {
                name: execution.event_name.clone(),
                data,
                id: id.clone(),
                timestamp: execution.created_at,
            },
            step: runner,
        };
        let outcome = std::panic::AssertUnwindSafe(handler.invoke(context))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err("handler panicked".into()));

        // 6/7. Persist the outcome.
        match outcome {
            Ok(result) => self.complete(&id, result).await,
            Err(failure) => {
                let message = failure.to_string();
                let stack = format!("{:?}", failure);
                self.fail(&id, &handler, message, stack).await;
            }
        }

        if let Err(e) = step_conn.disconnect().await {
            warn!("step connection disconnect failed for {}: {}", id, e);
        }
    }

    async fn complete(&self, id: &str, result: Value) {
        let now = now_millis();
        let mut update = ExecutionUpdate::status(ExecutionStatus::Completed, now);
        update.result = Some(result.clone());
        // Error fields describe the most recent attempt only; a
        // successful attempt leaves none behind. The attempt count is
        // preserved as the failure tally that preceded this success.
        update.clear_errors = true;

        let kv_fields = [
            ("status".to_string(), ExecutionStatus::Completed.as_str().to_string()),
            ("result".to_string(), result.to_string()),
            ("error".to_string(), String::new()),
            ("errorStack".to_string(), String::new()),
            ("updatedAt".to_string(), now.to_string()),
        ];

        let execution_key = self.keys.execution(id);
        let (kv_write, doc_write) = tokio::join!(
            self.kv.hash_set(&execution_key, &kv_fields),
            self.doc.update_execution(id, update),
        );
        if let Err(e) = kv_write {
            self.emit_store_error(id, "marking completed (kv)", &e.to_string());
            return;
        }
        if let Err(e) = doc_write {
            self.emit_store_error(id, "marking completed (doc)", &e.to_string());
            return;
        }

        // Both writes settled; only now do observers hear about it.
        info!("execution {} completed", id);
        self.bus.emit(WorchEvent::ExecutionComplete {
            execution_id: id.to_string(),
            result: result.clone(),
        });
        self.bus.emit(WorchEvent::ExecutionUpdated {
            execution_id: id.to_string(),
            status: ExecutionStatus::Completed,
            result: Some(result),
            error: None,
            attempt_count: None,
        });
    }

    async fn fail(&self, id: &str, handler: &Handler, message: String, stack: String) {
        // Reload for the authoritative attempt count; the in-memory copy
        // may predate a concurrent manual retry.
        let attempt_count = match self.kv.hash_get_all(&self.keys.execution(id)).await {
            Ok(fields) => Execution::from_kv_fields(id, &fields)
                .map(|execution| execution.attempt_count)
                .unwrap_or(0),
            Err(e) => {
                self.emit_store_error(id, "reloading before retry decision", &e.to_string());
                0
            }
        };

        let will_retry = attempt_count < handler.retries();
        let next_attempt_count = attempt_count + 1;
        let status = if will_retry {
            ExecutionStatus::Retrying
        } else {
            ExecutionStatus::Failed
        };
        let now = now_millis();

        let kv_fields = [
            ("status".to_string(), status.as_str().to_string()),
            ("attemptCount".to_string(), next_attempt_count.to_string()),
            ("error".to_string(), message.clone()),
            ("errorStack".to_string(), stack.clone()),
            ("updatedAt".to_string(), now.to_string()),
        ];
        let mut update = ExecutionUpdate::status(status, now);
        update.attempt_count = Some(next_attempt_count);
        update.error = Some(message.clone());
        update.error_stack = Some(stack);

        let execution_key = self.keys.execution(id);
        let (kv_write, doc_write) = tokio::join!(
            self.kv.hash_set(&execution_key, &kv_fields),
            self.doc.update_execution(id, update),
        );
        if let Err(e) = kv_write {
            self.emit_store_error(id, "marking failure (kv)", &e.to_string());
        }
        if let Err(e) = doc_write {
            self.emit_store_error(id, "marking failure (doc)", &e.to_string());
        }

        warn!(
            "execution {} failed (attempt {}, will_retry={}): {}",
            id, next_attempt_count, will_retry, message
        );
        self.bus.emit(WorchEvent::ExecutionFailed {
            execution_id: id.to_string(),
            error: message.clone(),
            attempt_count: next_attempt_count,
            will_retry,
        });
        self.bus.emit(WorchEvent::ExecutionUpdated {
            execution_id: id.to_string(),
            status,
            result: None,
            error: Some(message),
            attempt_count: Some(next_attempt_count),
        });

        if will_retry && self.running.load(Ordering::SeqCst) {
            self.schedule_retry(id.to_string(), handler.retry_delay());
        }
    }

    /// Re-enqueues after the handler's delay; dropped if the pool stopped
    /// in the meantime.
    fn schedule_retry(&self, id: String, delay: Duration) {
        let kv = Arc::clone(&self.kv);
        let queue = self.keys.queue();
        let running = Arc::clone(&self.running);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !running.load(Ordering::SeqCst) {
                debug!("dropping retry for {} after stop", id);
                return;
            }
            if let Err(e) = kv.list_push_right(&queue, &id).await {
                error!("failed to re-enqueue {} for retry: {}", id, e);
                bus.emit(WorchEvent::Error {
                    message: format!("retry enqueue failed for {}: {}", id, e),
                });
            } else {
                debug!("re-enqueued {} for retry", id);
            }
        });
    }

    /// Terminal failure for records that can never succeed (malformed or
    /// without a handler); the retry policy does not apply.
    async fn fail_without_retry(&self, id: &str, message: String) {
        let now = now_millis();
        let kv_fields = [
            ("status".to_string(), ExecutionStatus::Failed.as_str().to_string()),
            ("error".to_string(), message.clone()),
            ("updatedAt".to_string(), now.to_string()),
        ];
        let mut update = ExecutionUpdate::status(ExecutionStatus::Failed, now);
        update.error = Some(message.clone());

        let execution_key = self.keys.execution(id);
        let (kv_write, doc_write) = tokio::join!(
            self.kv.hash_set(&execution_key, &kv_fields),
            self.doc.update_execution(id, update),
        );
        if let Err(e) = kv_write {
            self.emit_store_error(id, "marking terminal failure (kv)", &e.to_string());
        }
        if let Err(e) = doc_write {
            self.emit_store_error(id, "marking terminal failure (doc)", &e.to_string());
        }

        warn!("execution {} failed terminally: {}", id, message);
        self.bus.emit(WorchEvent::ExecutionFailed {
            execution_id: id.to_string(),
            error: message.clone(),
            attempt_count: 0,
            will_retry: false,
        });
        self.bus.emit(WorchEvent::ExecutionUpdated {
            execution_id: id.to_string(),
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(message),
            attempt_count: None,
        });
    }

    fn emit_store_error(&self, id: &str, during: &str, message: &str) {
        error!("store failure while {} for {}: {}", during, id, message);
        self.bus.emit(WorchEvent::Error {
            message: format!("store failure while {} for {}: {}", during, id, message),
        });
    }
}
