//! Redis implementation of the KV/queue store.
//!
//! One `RedisKv` value wraps one multiplexed connection. Workers and
//! per-execution step runners call [`KvStore::duplicate`] to open their
//! own connections from the shared client, keeping the blocking `BLPOP`
//! away from metadata and cache traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::debug;

use super::error::{Result, StorageError};
use super::kv::KvStore;

pub struct RedisKv {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisKv {
    /// Connects to the store at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| StorageError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        debug!("connected to redis at {}", url);
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        // Multiplexed connections are handles onto one socket; cloning
        // per operation keeps &self methods borrow-free.
        self.conn.clone()
    }
}

fn kv_err(e: redis::RedisError) -> StorageError {
    StorageError::Connection(e.to_string())
}

#[async_trait]
impl KvStore for RedisKv {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, fields).await.map_err(kv_err)?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(key).await.map_err(kv_err)?;
        Ok(fields)
    }

    async fn hash_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.hget(key, field).await.map_err(kv_err)?;
        Ok(value)
    }

    async fn list_push_right(&self, list: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.rpush(list, value).await.map_err(kv_err)?;
        Ok(())
    }

    async fn list_pop_left_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.conn();
        // BLPOP returns (list, value) or nil on timeout; the server
        // guarantees each value goes to exactly one blocked client.
        let reply: Option<(String, String)> = conn
            .blpop(list, timeout.as_secs_f64())
            .await
            .map_err(kv_err)?;
        Ok(reply.map(|(_, value)| value))
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(reply.is_some())
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: bool = conn
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        // TTL returns -2 for a missing key and -1 for no expiry; both
        // collapse to 0 under the "seconds remaining" contract.
        let ttl: i64 = conn.ttl(key).await.map_err(kv_err)?;
        Ok(ttl.max(0))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await.map_err(kv_err)?;
        Ok(())
    }

    async fn duplicate(&self) -> Result<Arc<dyn KvStore>> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(kv_err)?;
        Ok(Arc::new(Self {
            client: self.client.clone(),
            conn,
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        // Dropping the last clone of the multiplexed connection closes
        // the socket; nothing to flush explicitly.
        Ok(())
    }
}
