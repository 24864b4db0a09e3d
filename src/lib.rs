//! worchflow: a durable workflow orchestration engine.
//!
//! Producers submit named events carrying JSON payloads; a worker pool
//! executes registered handlers against them. Handlers are composed of
//! named *steps* that are memoized, so a retried or crash-resumed
//! execution replays cached step results instead of re-running them. A
//! cron scheduler with single-leader election fires scheduled handlers
//! and replays missed runs.
//!
//! State lives in two stores: a KV store (Redis) holds the queue and hot
//! metadata, a document store (MongoDB) is the source of truth with
//! history and indexes. In-memory implementations of both back the test
//! suite.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use worchflow::{Client, Event, Handler, Worcher};
//! use worchflow::storage::{MongoDoc, RedisKv};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let kv = Arc::new(RedisKv::connect("redis://127.0.0.1:6379").await?);
//!     let doc = Arc::new(MongoDoc::connect("mongodb://127.0.0.1:27017", "worchflow").await?);
//!
//!     let shout = Handler::new("simple-event", |ctx| async move {
//!         let value = ctx.event.data["value"].as_str().unwrap_or_default().to_string();
//!         let processed: String = ctx
//!             .step
//!             .run("uppercase the value", || async move { Ok::<_, String>(value.to_uppercase()) })
//!             .await?;
//!         Ok(json!({ "processed": processed }))
//!     });
//!
//!     let pool = Worcher::new(kv.clone(), doc.clone(), vec![shout], 3, "worchflow")?;
//!     pool.connect().await?;
//!     pool.start().await?;
//!
//!     let client = Client::new(kv, doc, "worchflow");
//!     client.connect().await?;
//!     let id = client.submit(Event::new("simple-event", json!({"value": "hello"}))).await?;
//!     println!("submitted {id}");
//!     Ok(())
//! }
//! ```
//!
//! # Module organization
//!
//! - [`core`]: records, the submission contract, step digest and cache codec
//! - [`storage`]: KV/queue and document store adapters
//! - [`executor`]: client, step runner, worker pool, event bus, monitor reads
//! - [`schedule`]: cron utilities and the leader-elected scheduler
//! - [`config`]: environment configuration

pub mod config;
pub mod core;
pub mod executor;
pub mod schedule;
pub mod storage;

pub use config::Config;
pub use core::{Event, Execution, ExecutionStatus, StepRecord};
pub use executor::{
    BoxError, Client, EventBus, ExecutionError, Handler, HandlerContext, HandlerEvent, Monitor,
    StepRunner, Worcher, WorchEvent,
};
pub use schedule::{ScheduleError, Scheduler, SchedulerConfig};
pub use storage::{DocStore, KvStore, MemoryDoc, MemoryKv, StorageError};

#[cfg(feature = "mongo-store")]
pub use storage::MongoDoc;
#[cfg(feature = "redis-store")]
pub use storage::RedisKv;

// Re-export dependencies that appear in the public API so embedders
// don't fight version mismatches.
pub use serde_json;
pub use tokio;
