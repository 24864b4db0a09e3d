//! Persistence layer: the KV/queue store (hot path) and the document
//! store (source of truth), each behind an async trait with a production
//! backend and an in-memory stand-in for tests.

mod doc;
mod error;
mod kv;
mod memory;

#[cfg(feature = "mongo-store")]
mod mongo;
#[cfg(feature = "redis-store")]
mod redis;

pub use doc::{DocStore, ExecutionFilter, ExecutionUpdate};
pub use error::{Result, StorageError};
pub use kv::{KeySpace, KvStore, DEFAULT_QUEUE_PREFIX};
pub use memory::{MemoryDoc, MemoryKv};

#[cfg(feature = "mongo-store")]
pub use mongo::MongoDoc;
#[cfg(feature = "redis-store")]
pub use redis::RedisKv;
