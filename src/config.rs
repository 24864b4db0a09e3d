//! Configuration loading from environment variables.
//!
//! Everything has a local-development default except nothing: a bare
//! `Config::from_env()` points at localhost stores with the standard
//! queue prefix. Invalid values are errors, not silent fallbacks.

use std::time::Duration;

use crate::schedule::SchedulerConfig;
use crate::storage::DEFAULT_QUEUE_PREFIX;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// KV/queue store endpoint.
    pub redis_url: String,
    /// Document store endpoint.
    pub mongo_url: String,
    /// Document store database name.
    pub mongo_database: String,
    /// Namespace prefix for all KV keys.
    pub queue_prefix: String,
    /// Dequeue workers per pool.
    pub concurrency: usize,
    /// Whether the embedding binary should install a log subscriber.
    pub logging: bool,
    pub leader_election: bool,
    pub leader_ttl: Duration,
    pub leader_check_interval: Duration,
}

impl Config {
    /// Loads configuration from `WORCHFLOW_*` environment variables.
    ///
    /// Optional (with defaults):
    /// - `WORCHFLOW_REDIS_URL` (default `redis://127.0.0.1:6379`)
    /// - `WORCHFLOW_MONGO_URL` (default `mongodb://127.0.0.1:27017`)
    /// - `WORCHFLOW_MONGO_DB` (default `worchflow`)
    /// - `WORCHFLOW_QUEUE_PREFIX` (default `worchflow`)
    /// - `WORCHFLOW_CONCURRENCY` (default 1)
    /// - `WORCHFLOW_LOGGING` (default true)
    /// - `WORCHFLOW_LEADER_ELECTION` (default true)
    /// - `WORCHFLOW_LEADER_TTL_SECS` (default 60)
    /// - `WORCHFLOW_LEADER_CHECK_INTERVAL_MS` (default 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis_url = env_or("WORCHFLOW_REDIS_URL", "redis://127.0.0.1:6379");
        let mongo_url = env_or("WORCHFLOW_MONGO_URL", "mongodb://127.0.0.1:27017");
        let mongo_database = env_or("WORCHFLOW_MONGO_DB", "worchflow");
        let queue_prefix = env_or("WORCHFLOW_QUEUE_PREFIX", DEFAULT_QUEUE_PREFIX);

        let concurrency: usize = parse_env("WORCHFLOW_CONCURRENCY", "1", "a positive integer")?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid(
                "WORCHFLOW_CONCURRENCY",
                "must be at least 1",
            ));
        }
        let logging: bool = parse_env("WORCHFLOW_LOGGING", "true", "true or false")?;
        let leader_election: bool =
            parse_env("WORCHFLOW_LEADER_ELECTION", "true", "true or false")?;
        let leader_ttl_secs: u64 =
            parse_env("WORCHFLOW_LEADER_TTL_SECS", "60", "a number of seconds")?;
        let leader_check_interval_ms: u64 = parse_env(
            "WORCHFLOW_LEADER_CHECK_INTERVAL_MS",
            "30000",
            "a number of milliseconds",
        )?;

        Ok(Self {
            redis_url,
            mongo_url,
            mongo_database,
            queue_prefix,
            concurrency,
            logging,
            leader_election,
            leader_ttl: Duration::from_secs(leader_ttl_secs),
            leader_check_interval: Duration::from_millis(leader_check_interval_ms),
        })
    }

    /// The scheduler's slice of the configuration.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            leader_election: self.leader_election,
            leader_ttl: self.leader_ttl,
            leader_check_interval: self.leader_check_interval,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, expected))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {0}: expected {1}")]
    Invalid(&'static str, &'static str),
}
