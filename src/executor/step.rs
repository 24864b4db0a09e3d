//! Memoized step execution.
//!
//! `StepRunner::run` is the checkpointing primitive handlers build on:
//! the first successful computation of a titled step is persisted to both
//! stores, and every later attempt of the same execution gets the cached
//! value back instead of re-executing. Lookup is three-tier: the
//! in-process memo for repeats within one invocation, the KV wrapper
//! blob for resumed attempts, then the caller's compute function.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::{decode_step_blob, encode_step_value, now_millis, step_id, StepLookup, StepRecord};
use crate::storage::{DocStore, KeySpace, KvStore};

use super::bus::{EventBus, WorchEvent};
use super::handler::BoxError;

/// Step interface handed to a handler, bound to one execution and one
/// dedicated KV connection.
#[derive(Clone)]
pub struct StepRunner {
    execution_id: String,
    kv: Arc<dyn KvStore>,
    doc: Arc<dyn DocStore>,
    steps_key: String,
    bus: EventBus,
    memo: Arc<Mutex<HashMap<String, Value>>>,
}

impl StepRunner {
    pub(crate) fn new(
        execution_id: String,
        kv: Arc<dyn KvStore>,
        doc: Arc<dyn DocStore>,
        keys: &KeySpace,
        bus: EventBus,
    ) -> Self {
        let steps_key = keys.steps(&execution_id);
        Self {
            execution_id,
            kv,
            doc,
            steps_key,
            bus,
            memo: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `compute` at most once successfully for this (execution,
    /// title) pair.
    ///
    /// On a cache hit the stored value is returned without invoking
    /// `compute`; a cached null is still a hit. On success the step row
    /// and the KV cache entry are written in parallel before the value is
    /// returned. Errors from `compute` propagate unchanged and nothing is
    /// written; catching them is the worker pool's job, not this one's.
    pub async fn run<T, F, Fut, E>(&self, title: &str, compute: F) -> Result<T, BoxError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let step_id = step_id(title);

        let memoized = self
            .memo
            .lock()
            .expect("step memo lock poisoned")
            .get(&step_id)
            .cloned();
        if let Some(value) = memoized {
            return Ok(serde_json::from_value(value)?);
        }

        let blob = self.kv.hash_field(&self.steps_key, &step_id).await?;
        if let StepLookup::Hit(value) = decode_step_blob(blob.as_deref()) {
            debug!(
                "step cache hit: execution={} step={:?}",
                self.execution_id, title
            );
            self.memo
                .lock()
                .expect("step memo lock poisoned")
                .insert(step_id, value.clone());
            return Ok(serde_json::from_value(value)?);
        }

        let value = compute().await.map_err(Into::into)?;

        let json = serde_json::to_value(&value)?;
        let record = StepRecord::completed(
            self.execution_id.clone(),
            step_id.clone(),
            title.to_string(),
            json.clone(),
            now_millis(),
        );
        let blob = encode_step_value(&json)?;

        let kv_fields = [(step_id.clone(), blob)];
        let (doc_write, kv_write) = tokio::join!(
            self.doc.upsert_step(&record),
            self.kv.hash_set(&self.steps_key, &kv_fields),
        );
        doc_write?;
        kv_write?;

        self.memo
            .lock()
            .expect("step memo lock poisoned")
            .insert(step_id, json);

        self.bus.emit(WorchEvent::StepComplete {
            execution_id: self.execution_id.clone(),
            step_name: title.to_string(),
        });

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryDoc, MemoryKv};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner(kv: &Arc<MemoryKv>, doc: &Arc<MemoryDoc>) -> StepRunner {
        StepRunner::new(
            "exec-1".to_string(),
            Arc::clone(kv) as Arc<dyn KvStore>,
            Arc::clone(doc) as Arc<dyn DocStore>,
            &KeySpace::default(),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn test_successful_step_is_computed_once() {
        let kv = Arc::new(MemoryKv::new());
        let doc = Arc::new(MemoryDoc::new());
        let calls = Arc::new(AtomicU32::new(0));

        // Two runners simulate two attempts of the same execution.
        for _ in 0..2 {
            let runner = runner(&kv, &doc);
            let calls = Arc::clone(&calls);
            let value: i64 = runner
                .run("add ten", || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(15)
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, 15);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let steps = doc.steps_for_execution("exec-1").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "add ten");
    }

    #[tokio::test]
    async fn test_null_result_is_cached() {
        let kv = Arc::new(MemoryKv::new());
        let doc = Arc::new(MemoryDoc::new());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let runner = runner(&kv, &doc);
            let calls = Arc::clone(&calls);
            let value: Option<String> = runner
                .run("maybe nothing", || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(None)
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, None);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_step_writes_nothing_and_reruns() {
        let kv = Arc::new(MemoryKv::new());
        let doc = Arc::new(MemoryDoc::new());

        let first = runner(&kv, &doc);
        let outcome: Result<i64, BoxError> = first
            .run("flaky", || async { Err::<i64, BoxError>("boom".into()) })
            .await;
        assert!(outcome.is_err());
        assert!(doc.steps_for_execution("exec-1").await.unwrap().is_empty());

        let second = runner(&kv, &doc);
        let value: i64 = second
            .run("flaky", || async { Ok::<_, BoxError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_in_process_memo_short_circuits() {
        let kv = Arc::new(MemoryKv::new());
        let doc = Arc::new(MemoryDoc::new());
        let runner = runner(&kv, &doc);

        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value: String = runner
                .run("greet", || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>("hi".to_string())
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, "hi");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
