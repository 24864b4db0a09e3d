//! Step checkpointing behavior through the full engine:
//! memoization across retries, null-result caching, retry exhaustion and
//! manual retry semantics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use worchflow::storage::{DocStore, KvStore, MemoryDoc, MemoryKv};
use worchflow::{BoxError, Client, Event, Execution, ExecutionStatus, Handler, Worcher};

async fn start_engine(
    handlers: Vec<Handler>,
    concurrency: usize,
) -> (Arc<MemoryKv>, Arc<MemoryDoc>, Arc<Worcher>, Client) {
    let kv = Arc::new(MemoryKv::new());
    let doc = Arc::new(MemoryDoc::new());

    let pool = Arc::new(
        Worcher::new(
            kv.clone() as Arc<dyn KvStore>,
            doc.clone() as Arc<dyn DocStore>,
            handlers,
            concurrency,
            "worchflow",
        )
        .unwrap(),
    );
    pool.connect().await.unwrap();
    pool.start().await.unwrap();

    let client = Client::new(
        kv.clone() as Arc<dyn KvStore>,
        doc.clone() as Arc<dyn DocStore>,
        "worchflow",
    );
    client.connect().await.unwrap();

    (kv, doc, pool, client)
}

async fn wait_for_status(doc: &MemoryDoc, id: &str, status: ExecutionStatus) -> Execution {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(execution) = doc.find_execution(id).await.unwrap() {
            if execution.status == status {
                return execution;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} to reach {}",
            id,
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_simple_step_execution() {
    let handler = Handler::new("simple-event", |ctx| async move {
        let value = ctx.event.data["value"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let processed: String = ctx
            .step
            .run("uppercase the value", || async move {
                Ok::<_, BoxError>(value.to_uppercase())
            })
            .await?;
        Ok(json!({ "processed": processed }))
    });

    let (_kv, doc, _pool, client) = start_engine(vec![handler], 1).await;

    let id = client
        .submit(Event::new("simple-event", json!({"value": "hello"})))
        .await
        .unwrap();

    let execution = wait_for_status(&doc, &id, ExecutionStatus::Completed).await;
    assert_eq!(execution.result, Some(json!({"processed": "HELLO"})));
    assert_eq!(execution.attempt_count, 0);

    let steps = doc.steps_for_execution(&id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].result, json!("HELLO"));
}

#[tokio::test]
async fn test_multi_step_sequence() {
    let handler = Handler::new("counter-event", |ctx| async move {
        let count = ctx.event.data["count"].as_i64().unwrap_or_default();
        let added: i64 = ctx
            .step
            .run("add ten", || async move { Ok::<_, BoxError>(count + 10) })
            .await?;
        let doubled: i64 = ctx
            .step
            .run("double it", || async move { Ok::<_, BoxError>(added * 2) })
            .await?;
        let trimmed: i64 = ctx
            .step
            .run("subtract five", || async move { Ok::<_, BoxError>(doubled - 5) })
            .await?;
        Ok(json!({ "result": trimmed }))
    });

    let (_kv, doc, _pool, client) = start_engine(vec![handler], 1).await;

    let id = client
        .submit(Event::new("counter-event", json!({"count": 5})))
        .await
        .unwrap();

    let execution = wait_for_status(&doc, &id, ExecutionStatus::Completed).await;
    assert_eq!(execution.result, Some(json!({"result": 25})));

    let steps = doc.steps_for_execution(&id).await.unwrap();
    let results: Vec<_> = steps.iter().map(|s| s.result.clone()).collect();
    assert_eq!(results, vec![json!(15), json!(30), json!(25)]);
}

#[tokio::test]
async fn test_retry_resumes_after_checkpoint() {
    let step_one_calls = Arc::new(AtomicU32::new(0));
    let step_two_calls = Arc::new(AtomicU32::new(0));
    let step_three_calls = Arc::new(AtomicU32::new(0));

    let handler = {
        let step_one_calls = step_one_calls.clone();
        let step_two_calls = step_two_calls.clone();
        let step_three_calls = step_three_calls.clone();
        Handler::new("flaky-event", move |ctx| {
            let step_one_calls = step_one_calls.clone();
            let step_two_calls = step_two_calls.clone();
            let step_three_calls = step_three_calls.clone();
            async move {
                let first: i64 = ctx
                    .step
                    .run("first step", || async move {
                        step_one_calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(1)
                    })
                    .await?;
                let second: i64 = ctx
                    .step
                    .run("second step", || async move {
                        // Fails on the first compute only.
                        if step_two_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err::<i64, BoxError>("transient failure".into())
                        } else {
                            Ok(first + 1)
                        }
                    })
                    .await?;
                let third: i64 = ctx
                    .step
                    .run("third step", || async move {
                        step_three_calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(second + 1)
                    })
                    .await?;
                Ok(json!({ "total": third }))
            }
        })
        .with_retries(1)
    };

    let (_kv, doc, _pool, client) = start_engine(vec![handler], 1).await;

    let id = client
        .submit(Event::new("flaky-event", json!({})))
        .await
        .unwrap();

    let execution = wait_for_status(&doc, &id, ExecutionStatus::Completed).await;
    assert_eq!(execution.result, Some(json!({"total": 3})));
    assert_eq!(execution.attempt_count, 1);
    // The error fields describe the latest attempt, which succeeded.
    assert_eq!(execution.error, None);

    // Step one was served from cache on the retry; step two computed
    // twice (fail, then succeed); step three only ever ran once.
    assert_eq!(step_one_calls.load(Ordering::SeqCst), 1);
    assert_eq!(step_two_calls.load(Ordering::SeqCst), 2);
    assert_eq!(step_three_calls.load(Ordering::SeqCst), 1);

    let steps = doc.steps_for_execution(&id).await.unwrap();
    assert_eq!(steps.len(), 3);
}

#[tokio::test]
async fn test_null_step_result_not_recomputed_on_retry() {
    let lookup_calls = Arc::new(AtomicU32::new(0));
    let attempt = Arc::new(AtomicU32::new(0));

    let handler = {
        let lookup_calls = lookup_calls.clone();
        let attempt = attempt.clone();
        Handler::new("nullable-event", move |ctx| {
            let lookup_calls = lookup_calls.clone();
            let attempt = attempt.clone();
            async move {
                let found: Option<String> = ctx
                    .step
                    .run("lookup that finds nothing", || async move {
                        lookup_calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(None)
                    })
                    .await?;
                assert_eq!(found, None);

                // Fail the first attempt after the step completed, so the
                // retry replays over the cached null.
                if attempt.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err("fail after step".into());
                }
                Ok(json!({ "found": found }))
            }
        })
        .with_retries(1)
    };

    let (_kv, doc, _pool, client) = start_engine(vec![handler], 1).await;

    let id = client
        .submit(Event::new("nullable-event", json!({})))
        .await
        .unwrap();

    let execution = wait_for_status(&doc, &id, ExecutionStatus::Completed).await;
    assert_eq!(execution.result, Some(json!({"found": null})));
    assert_eq!(lookup_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retries_exhausted_marks_failed() {
    let invocations = Arc::new(AtomicU32::new(0));

    let handler = {
        let invocations = invocations.clone();
        Handler::new("doomed-event", move |_ctx| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err("always broken".into())
            }
        })
        .with_retries(2)
    };

    let (_kv, doc, _pool, client) = start_engine(vec![handler], 1).await;

    let id = client
        .submit(Event::new("doomed-event", json!({})))
        .await
        .unwrap();

    let execution = wait_for_status(&doc, &id, ExecutionStatus::Failed).await;
    // retries = 2 allows three invocations in total.
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(execution.attempt_count, 3);
    assert_eq!(execution.error, Some("always broken".to_string()));
    assert!(execution.error_stack.is_some());
}

#[tokio::test]
async fn test_manual_retry_resets_both_stores() {
    let kv = Arc::new(MemoryKv::new());
    let doc = Arc::new(MemoryDoc::new());
    let client = Client::new(
        kv.clone() as Arc<dyn KvStore>,
        doc.clone() as Arc<dyn DocStore>,
        "worchflow",
    );
    client.connect().await.unwrap();

    // No pool running; shape the record by hand into a failed state.
    let id = client
        .submit(Event::new("some-event", json!({"n": 1})))
        .await
        .unwrap();
    let now = worchflow::core::now_millis();
    doc.update_execution(&id, {
        let mut update =
            worchflow::storage::ExecutionUpdate::status(ExecutionStatus::Failed, now);
        update.attempt_count = Some(3);
        update.error = Some("kaput".to_string());
        update.error_stack = Some("trace".to_string());
        update
    })
    .await
    .unwrap();
    kv.hash_set(
        &format!("worchflow:execution:{}", id),
        &[
            ("status".to_string(), "failed".to_string()),
            ("attemptCount".to_string(), "3".to_string()),
            ("error".to_string(), "kaput".to_string()),
            ("errorStack".to_string(), "trace".to_string()),
        ],
    )
    .await
    .unwrap();

    client.manual_retry(&id).await.unwrap();

    let stored = doc.find_execution(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Queued);
    assert_eq!(stored.attempt_count, 0);
    assert_eq!(stored.error, None);
    assert_eq!(stored.error_stack, None);

    let fields = kv
        .hash_get_all(&format!("worchflow:execution:{}", id))
        .await
        .unwrap();
    let restored = Execution::from_kv_fields(&id, &fields).unwrap();
    assert_eq!(restored.status, ExecutionStatus::Queued);
    assert_eq!(restored.attempt_count, 0);
    assert_eq!(restored.error, None);

    // The id is back on the queue exactly once.
    let first = kv
        .list_pop_left_blocking("worchflow:queue", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(first.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn test_manual_retry_drives_failed_execution_to_completion() {
    let attempt = Arc::new(AtomicU32::new(0));

    let handler = {
        let attempt = attempt.clone();
        Handler::new("eventually-fine", move |_ctx| {
            let attempt = attempt.clone();
            async move {
                // Fails on the first invocation, succeeds afterwards.
                if attempt.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("first time unlucky".into())
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        })
    };

    let (_kv, doc, _pool, client) = start_engine(vec![handler], 1).await;

    let id = client
        .submit(Event::new("eventually-fine", json!({})))
        .await
        .unwrap();

    let failed = wait_for_status(&doc, &id, ExecutionStatus::Failed).await;
    assert_eq!(failed.attempt_count, 1);

    client.manual_retry(&id).await.unwrap();

    let completed = wait_for_status(&doc, &id, ExecutionStatus::Completed).await;
    assert_eq!(completed.result, Some(json!({"ok": true})));
    // Manual retry zeroed the count; success preserves it.
    assert_eq!(completed.attempt_count, 0);
    assert_eq!(completed.error, None);
}
