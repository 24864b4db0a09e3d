//! KV/queue store abstraction.
//!
//! The engine's hot path lives here: execution hashes, the FIFO queue,
//! step caches and the scheduler's leader key. Implementations must make
//! `list_pop_left_blocking` atomic across concurrent callers; it is the
//! linearization point of the whole queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::error::Result;

/// Async interface over the KV/queue store.
///
/// One adapter value corresponds to one connection. The blocking list pop
/// monopolizes its connection for up to the full timeout, so anything
/// that must not wait behind it (metadata updates, step cache traffic)
/// runs on a separate adapter obtained through [`KvStore::duplicate`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Round-trips to the store; used by startup handshakes.
    async fn ping(&self) -> Result<()>;

    /// Sets hash fields, last-writer-wins per field.
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Returns all fields of a hash; empty map if the key is absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Returns a single hash field, absent if either key or field is missing.
    async fn hash_field(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// FIFO append.
    async fn list_push_right(&self, list: &str, value: &str) -> Result<()>;

    /// Blocks up to `timeout` for a value; `None` on timeout. Each value
    /// is delivered to exactly one caller.
    async fn list_pop_left_blocking(&self, list: &str, timeout: Duration)
        -> Result<Option<String>>;

    /// Atomic set-if-absent with expiry; `true` when this caller won.
    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Resets the expiry of an existing key.
    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Seconds until the key expires; 0 if absent or already expired.
    async fn remaining_ttl(&self, key: &str) -> Result<i64>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Opens an independent connection sharing this adapter's
    /// configuration and backing store.
    async fn duplicate(&self) -> Result<Arc<dyn KvStore>>;

    /// Releases the underlying connection. Further calls on this adapter
    /// are invalid.
    async fn disconnect(&self) -> Result<()>;
}

/// Builds the namespaced keys of the engine's KV layout.
///
/// All keys for one deployment share a configurable prefix so multiple
/// deployments can coexist on one store.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

pub const DEFAULT_QUEUE_PREFIX: &str = "worchflow";

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The FIFO list of queued execution ids.
    pub fn queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    /// Hash of stringified execution fields.
    pub fn execution(&self, id: &str) -> String {
        format!("{}:execution:{}", self.prefix, id)
    }

    /// Hash of step-id to wrapped cache blob.
    pub fn steps(&self, id: &str) -> String {
        format!("{}:steps:{}", self.prefix, id)
    }

    /// The scheduler's leader-election TTL key.
    pub fn leader(&self) -> String {
        format!("{}:scheduler:leader", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_PREFIX)
    }
}
