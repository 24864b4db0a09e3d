//! In-memory store implementations.
//!
//! `MemoryKv` and `MemoryDoc` carry the same semantics as the Redis and
//! MongoDB adapters over process-local state, which is what the
//! integration tests run on. `MemoryKv::duplicate` hands out a new
//! adapter over the same shared state, mirroring a second connection to
//! the same server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::{CronExecution, Execution, ExecutionStatus, StepRecord};

use super::doc::{DocStore, ExecutionFilter, ExecutionUpdate};
use super::error::{Result, StorageError};
use super::kv::KvStore;

#[derive(Default)]
struct KvState {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    /// TTL-bound string values, keyed with their expiry deadline.
    values: HashMap<String, (String, Instant)>,
}

impl KvState {
    fn drop_expired(&mut self, key: &str) {
        if let Some((_, deadline)) = self.values.get(key) {
            if Instant::now() >= *deadline {
                self.values.remove(key);
            }
        }
    }
}

struct KvShared {
    state: Mutex<KvState>,
    pushed: Notify,
}

/// In-memory KV/queue store.
pub struct MemoryKv {
    shared: Arc<KvShared>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(KvShared {
                state: Mutex::new(KvState::default()),
                pushed: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KvState> {
        // The lock is only held across plain map operations; a poisoned
        // lock means a panic already tore the test down.
        self.shared.state.lock().expect("kv state lock poisoned")
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut state = self.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn list_push_right(&self, list: &str, value: &str) -> Result<()> {
        self.lock()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        self.shared.pushed.notify_waiters();
        Ok(())
    }

    async fn list_pop_left_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for the wakeup before checking the queue so a
            // push between check and await is not lost.
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = self
                .lock()
                .lists
                .get_mut(list)
                .and_then(|queue| queue.pop_front());
            if let Some(value) = popped {
                return Ok(Some(value));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.lock();
        state.drop_expired(key);
        if state.values.contains_key(key) {
            return Ok(false);
        }
        state
            .values
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut state = self.lock();
        state.drop_expired(key);
        if let Some((_, deadline)) = state.values.get_mut(key) {
            *deadline = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<i64> {
        let mut state = self.lock();
        state.drop_expired(key);
        Ok(match state.values.get(key) {
            Some((_, deadline)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                remaining.as_secs_f64().ceil() as i64
            }
            None => 0,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.lock();
        state.values.remove(key);
        state.hashes.remove(key);
        state.lists.remove(key);
        Ok(())
    }

    async fn duplicate(&self) -> Result<Arc<dyn KvStore>> {
        Ok(Arc::new(Self {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory document store on DashMap collections.
pub struct MemoryDoc {
    executions: DashMap<String, Execution>,
    /// Keyed on the unique (execution_id, step_id) pair; the sequence
    /// number breaks timestamp ties so listing preserves completion order.
    steps: DashMap<(String, String), (u64, StepRecord)>,
    cron_executions: DashMap<String, CronExecution>,
    step_seq: AtomicU64,
}

impl MemoryDoc {
    pub fn new() -> Self {
        Self {
            executions: DashMap::new(),
            steps: DashMap::new(),
            cron_executions: DashMap::new(),
            step_seq: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryDoc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocStore for MemoryDoc {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<()> {
        // Uniqueness is enforced on the write paths; nothing to build.
        Ok(())
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        match self.executions.entry(execution.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::DuplicateKey {
                collection: "executions",
                key: execution.id.clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                Ok(())
            }
        }
    }

    async fn find_execution(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self.executions.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>> {
        let mut matches: Vec<Execution> = self
            .executions
            .iter()
            .filter(|entry| {
                let execution = entry.value();
                (filter.statuses.is_empty() || filter.statuses.contains(&execution.status))
                    && filter
                        .event_name
                        .as_ref()
                        .map_or(true, |name| *name == execution.event_name)
            })
            .map(|entry| entry.value().clone())
            .collect();

        // Secondary id ordering keeps listings deterministic when
        // created_at collides within one millisecond.
        matches.sort_by(|a, b| {
            let ordering = a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id));
            if filter.oldest_first {
                ordering
            } else {
                ordering.reverse()
            }
        });

        let skipped = matches.into_iter().skip(filter.skip as usize);
        Ok(match filter.limit {
            Some(limit) => skipped.take(limit.max(0) as usize).collect(),
            None => skipped.collect(),
        })
    }

    async fn count_executions(&self, status: Option<ExecutionStatus>) -> Result<u64> {
        Ok(self
            .executions
            .iter()
            .filter(|entry| status.map_or(true, |s| entry.value().status == s))
            .count() as u64)
    }

    async fn update_execution(&self, id: &str, update: ExecutionUpdate) -> Result<()> {
        if let Some(mut entry) = self.executions.get_mut(id) {
            let execution = entry.value_mut();
            if let Some(status) = update.status {
                execution.status = status;
            }
            if let Some(attempt_count) = update.attempt_count {
                execution.attempt_count = attempt_count;
            }
            if let Some(result) = update.result {
                execution.result = Some(result);
            }
            if let Some(error) = update.error {
                execution.error = Some(error);
            }
            if let Some(stack) = update.error_stack {
                execution.error_stack = Some(stack);
            }
            if update.clear_errors {
                execution.error = None;
                execution.error_stack = None;
            }
            execution.updated_at = update.updated_at;
        }
        Ok(())
    }

    async fn upsert_step(&self, step: &StepRecord) -> Result<()> {
        let key = (step.execution_id.clone(), step.step_id.clone());
        let seq = self.step_seq.fetch_add(1, Ordering::SeqCst);
        self.steps.insert(key, (seq, step.clone()));
        Ok(())
    }

    async fn steps_for_execution(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        let mut rows: Vec<(u64, StepRecord)> = self
            .steps
            .iter()
            .filter(|entry| entry.key().0 == execution_id)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|(seq, step)| (step.timestamp, *seq));
        Ok(rows.into_iter().map(|(_, step)| step).collect())
    }

    async fn upsert_cron_execution(&self, record: &CronExecution) -> Result<()> {
        self.cron_executions
            .insert(record.function_id.clone(), record.clone());
        Ok(())
    }

    async fn find_cron_execution(&self, function_id: &str) -> Result<Option<CronExecution>> {
        Ok(self
            .cron_executions
            .get(function_id)
            .map(|entry| entry.value().clone()))
    }
}
