//! Document store abstraction.
//!
//! The document store is the source of truth: full execution history,
//! step rows and cron bookkeeping, with the secondary indexes the
//! monitoring reads depend on. Operations are entity-level rather than a
//! generic collection API; the `$set`/`$unset` update semantics are
//! carried by [`ExecutionUpdate`].

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{CronExecution, Execution, ExecutionStatus, StepRecord};

use super::error::Result;

/// Filter, ordering and pagination for execution listings.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    /// Match any of these statuses; empty means all.
    pub statuses: Vec<ExecutionStatus>,
    pub event_name: Option<String>,
    pub limit: Option<i64>,
    pub skip: u64,
    /// Ascending `created_at` order; the default is newest first.
    pub oldest_first: bool,
}

impl ExecutionFilter {
    /// The orphan-recovery sweep: in-flight records, oldest first.
    pub fn in_flight() -> Self {
        Self {
            statuses: vec![ExecutionStatus::Processing, ExecutionStatus::Retrying],
            oldest_first: true,
            ..Self::default()
        }
    }
}

/// A partial update applied to one execution record.
///
/// Fields set to `Some` are written (`$set`); `clear_errors` removes the
/// error fields entirely (`$unset`), which is how a manual retry leaves
/// no trace of the previous failure.
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub attempt_count: Option<u32>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub clear_errors: bool,
    pub updated_at: i64,
}

impl ExecutionUpdate {
    pub fn status(status: ExecutionStatus, updated_at: i64) -> Self {
        Self {
            status: Some(status),
            attempt_count: None,
            result: None,
            error: None,
            error_stack: None,
            clear_errors: false,
            updated_at,
        }
    }
}

/// Async interface over the document store.
///
/// Implementations are shared by every component; concurrent updates on
/// distinct ids must be safe, concurrent updates on one id are
/// last-writer-wins.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Round-trips to the store; used by startup handshakes.
    async fn ping(&self) -> Result<()>;

    /// Creates the secondary indexes idempotently; an index that already
    /// exists with the same spec is success.
    async fn ensure_indexes(&self) -> Result<()>;

    /// Inserts a new execution; the unique id index rejects duplicates.
    async fn insert_execution(&self, execution: &Execution) -> Result<()>;

    async fn find_execution(&self, id: &str) -> Result<Option<Execution>>;

    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>>;

    async fn count_executions(&self, status: Option<ExecutionStatus>) -> Result<u64>;

    async fn update_execution(&self, id: &str, update: ExecutionUpdate) -> Result<()>;

    /// Writes a completed step row, replacing any previous row for the
    /// same (execution, step) pair. Replacement keeps a recomputed step
    /// (lost KV cache) from tripping the unique index.
    async fn upsert_step(&self, step: &StepRecord) -> Result<()>;

    /// Step rows for one execution, completion order (timestamp ascending).
    async fn steps_for_execution(&self, execution_id: &str) -> Result<Vec<StepRecord>>;

    async fn upsert_cron_execution(&self, record: &CronExecution) -> Result<()>;

    async fn find_cron_execution(&self, function_id: &str) -> Result<Option<CronExecution>>;
}
