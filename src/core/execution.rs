//! Execution, step and cron-execution records.
//!
//! Every record has two on-the-wire shapes: the document store holds
//! typed values, while the KV store accepts only string hash fields. The
//! conversions live here (`to_kv_fields` / `from_kv_fields`) so no call
//! site ever sees both shapes.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{CoreError, Result};

/// Lifecycle status of an execution.
///
/// `Completed` and `Failed` are absorbing for automatic processing;
/// `Processing` and `Retrying` are in-flight states that a worker startup
/// must reclaim as orphans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Retrying => "retrying",
        }
    }

    /// True for states a crashed worker can leave behind.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ExecutionStatus::Processing | ExecutionStatus::Retrying)
    }

    /// True once automatic processing will no longer touch the record.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl FromStr for ExecutionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ExecutionStatus::Queued),
            "processing" => Ok(ExecutionStatus::Processing),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "retrying" => Ok(ExecutionStatus::Retrying),
            other => Err(CoreError::InvalidStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One submitted event and its lifecycle.
///
/// `event_data` is the raw JSON text of the payload; the engine treats it
/// as opaque and only the owning handler decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub event_name: String,
    pub event_data: String,
    pub status: ExecutionStatus,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Execution {
    /// Creates a freshly queued execution with both timestamps set to `now`.
    pub fn queued(id: String, event_name: String, event_data: String, now: i64) -> Self {
        Self {
            id,
            event_name,
            event_data,
            status: ExecutionStatus::Queued,
            attempt_count: 0,
            result: None,
            error: None,
            error_stack: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Serializes the record into the all-string hash shape of the KV store.
    ///
    /// Optional fields are written only when present; a reader that finds
    /// no `error` field sees the same record as one written with
    /// `error: None`.
    pub fn to_kv_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("eventName".to_string(), self.event_name.clone()),
            ("eventData".to_string(), self.event_data.clone()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("attemptCount".to_string(), self.attempt_count.to_string()),
            ("createdAt".to_string(), self.created_at.to_string()),
            ("updatedAt".to_string(), self.updated_at.to_string()),
        ];
        if let Some(result) = &self.result {
            fields.push(("result".to_string(), result.to_string()));
        }
        if let Some(error) = &self.error {
            fields.push(("error".to_string(), error.clone()));
        }
        if let Some(stack) = &self.error_stack {
            fields.push(("errorStack".to_string(), stack.clone()));
        }
        fields
    }

    /// Reconstructs a record from a KV hash.
    ///
    /// `eventName`, `eventData` and `createdAt` are required; everything
    /// else falls back to the freshly-queued defaults so partially
    /// written records stay readable.
    pub fn from_kv_fields(id: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let event_name = fields
            .get("eventName")
            .filter(|v| !v.is_empty())
            .ok_or(CoreError::MissingField("eventName"))?
            .clone();
        let event_data = fields
            .get("eventData")
            .ok_or(CoreError::MissingField("eventData"))?
            .clone();
        let created_at = parse_i64(fields, "createdAt")?
            .ok_or(CoreError::MissingField("createdAt"))?;

        let status = match fields.get("status") {
            Some(raw) => raw.parse()?,
            None => ExecutionStatus::Queued,
        };
        let attempt_count = match fields.get("attemptCount") {
            Some(raw) => raw.parse().map_err(|_| CoreError::InvalidField {
                field: "attemptCount",
                value: raw.clone(),
            })?,
            None => 0,
        };
        let result = match fields.get("result") {
            Some(raw) => Some(serde_json::from_str(raw).map_err(CoreError::Serialization)?),
            None => None,
        };
        let updated_at = parse_i64(fields, "updatedAt")?.unwrap_or(created_at);

        Ok(Self {
            id: id.to_string(),
            event_name,
            event_data,
            status,
            attempt_count,
            result,
            // A cleared error is written as the empty string (hash
            // fields cannot be deleted through the adapter); both shapes
            // read back as absent.
            error: fields.get("error").filter(|v| !v.is_empty()).cloned(),
            error_stack: fields
                .get("errorStack")
                .filter(|v| !v.is_empty())
                .cloned(),
            created_at,
            updated_at,
        })
    }
}

fn parse_i64(fields: &HashMap<String, String>, field: &'static str) -> Result<Option<i64>> {
    match fields.get(field) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| CoreError::InvalidField {
                field,
                value: raw.clone(),
            }),
        None => Ok(None),
    }
}

/// A successfully completed step of an execution.
///
/// One row exists per (execution, step-title) pair that completed; failed
/// step attempts are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub execution_id: String,
    /// Digest of the step title, see [`crate::core::digest::step_id`].
    pub step_id: String,
    /// The human-readable step title.
    pub name: String,
    pub status: String,
    pub result: Value,
    pub timestamp: i64,
}

impl StepRecord {
    pub fn completed(
        execution_id: String,
        step_id: String,
        name: String,
        result: Value,
        timestamp: i64,
    ) -> Self {
        Self {
            execution_id,
            step_id,
            name,
            status: "completed".to_string(),
            result,
            timestamp,
        }
    }
}

/// Per-scheduled-function cron bookkeeping, unique on `function_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronExecution {
    pub function_id: String,
    pub last_execution_time: i64,
    pub next_scheduled_time: i64,
    pub cron_expression: String,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExecutionStatus::Queued,
            ExecutionStatus::Processing,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Retrying,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("running".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_in_flight_and_terminal() {
        assert!(ExecutionStatus::Processing.is_in_flight());
        assert!(ExecutionStatus::Retrying.is_in_flight());
        assert!(!ExecutionStatus::Queued.is_in_flight());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_kv_round_trip() {
        let mut execution = Execution::queued(
            "abc123".to_string(),
            "order-created".to_string(),
            "{\"total\":42}".to_string(),
            1_700_000_000_000,
        );
        execution.status = ExecutionStatus::Completed;
        execution.attempt_count = 2;
        execution.result = Some(json!({"ok": true}));
        execution.updated_at = 1_700_000_001_000;

        let fields: HashMap<String, String> = execution.to_kv_fields().into_iter().collect();
        let restored = Execution::from_kv_fields("abc123", &fields).unwrap();

        assert_eq!(restored.event_name, execution.event_name);
        assert_eq!(restored.event_data, execution.event_data);
        assert_eq!(restored.status, ExecutionStatus::Completed);
        assert_eq!(restored.attempt_count, 2);
        assert_eq!(restored.result, Some(json!({"ok": true})));
        assert_eq!(restored.created_at, execution.created_at);
        assert_eq!(restored.updated_at, execution.updated_at);
        assert_eq!(restored.error, None);
    }

    #[test]
    fn test_from_kv_fields_requires_core_fields() {
        let mut fields = HashMap::new();
        fields.insert("eventData".to_string(), "{}".to_string());
        fields.insert("createdAt".to_string(), "1".to_string());
        assert!(matches!(
            Execution::from_kv_fields("x", &fields),
            Err(CoreError::MissingField("eventName"))
        ));

        fields.insert("eventName".to_string(), "evt".to_string());
        fields.remove("createdAt");
        assert!(matches!(
            Execution::from_kv_fields("x", &fields),
            Err(CoreError::MissingField("createdAt"))
        ));
    }

    #[test]
    fn test_from_kv_fields_defaults() {
        let mut fields = HashMap::new();
        fields.insert("eventName".to_string(), "evt".to_string());
        fields.insert("eventData".to_string(), "{}".to_string());
        fields.insert("createdAt".to_string(), "123".to_string());

        let execution = Execution::from_kv_fields("x", &fields).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Queued);
        assert_eq!(execution.attempt_count, 0);
        assert_eq!(execution.updated_at, 123);
        assert!(execution.result.is_none());
    }
}
