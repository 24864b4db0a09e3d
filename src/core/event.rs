//! The submission contract between producers and the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named event carrying an opaque JSON payload.
///
/// `id` and `timestamp` are normally left to the engine; callers that
/// need deterministic ids (idempotent producers, replays) may supply
/// their own, with uniqueness enforced by the document store index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            id: None,
            timestamp: None,
        }
    }

    /// Pins the execution id instead of letting the engine generate one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
