//! Read-side queries backing the monitoring dashboard.
//!
//! Thin composition over the two stores: listings and stats come from
//! the document store, the raw hash view from the KV store. Writes
//! (retry, send) go through the [`Client`](super::client::Client).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::core::{Execution, ExecutionStatus, StepRecord};
use crate::storage::{DocStore, ExecutionFilter, KeySpace, KvStore, Result};

/// Everything the detail view shows for one execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetail {
    pub execution: Execution,
    pub steps: Vec<StepRecord>,
    /// The raw KV hash, stringified fields and all, for store-drift
    /// debugging.
    pub kv_execution: HashMap<String, String>,
}

/// Per-status execution counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
    pub total: u64,
}

pub struct Monitor {
    kv: Arc<dyn KvStore>,
    doc: Arc<dyn DocStore>,
    keys: KeySpace,
}

impl Monitor {
    pub fn new(kv: Arc<dyn KvStore>, doc: Arc<dyn DocStore>, queue_prefix: &str) -> Self {
        Self {
            kv,
            doc,
            keys: KeySpace::new(queue_prefix),
        }
    }

    /// Lists executions, newest first, optionally filtered by status.
    pub async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: i64,
        skip: u64,
    ) -> Result<Vec<Execution>> {
        self.doc
            .list_executions(ExecutionFilter {
                statuses: status.into_iter().collect(),
                limit: Some(limit),
                skip,
                ..ExecutionFilter::default()
            })
            .await
    }

    /// Full detail for one execution, or `None` if unknown.
    pub async fn execution_detail(&self, id: &str) -> Result<Option<ExecutionDetail>> {
        let Some(execution) = self.doc.find_execution(id).await? else {
            return Ok(None);
        };
        let execution_key = self.keys.execution(id);
        let (steps, kv_execution) = tokio::join!(
            self.doc.steps_for_execution(id),
            self.kv.hash_get_all(&execution_key),
        );
        Ok(Some(ExecutionDetail {
            execution,
            steps: steps?,
            kv_execution: kv_execution?,
        }))
    }

    pub async fn stats(&self) -> Result<Stats> {
        let (queued, processing, completed, failed, retrying, total) = tokio::join!(
            self.doc.count_executions(Some(ExecutionStatus::Queued)),
            self.doc.count_executions(Some(ExecutionStatus::Processing)),
            self.doc.count_executions(Some(ExecutionStatus::Completed)),
            self.doc.count_executions(Some(ExecutionStatus::Failed)),
            self.doc.count_executions(Some(ExecutionStatus::Retrying)),
            self.doc.count_executions(None),
        );
        Ok(Stats {
            queued: queued?,
            processing: processing?,
            completed: completed?,
            failed: failed?,
            retrying: retrying?,
            total: total?,
        })
    }
}
