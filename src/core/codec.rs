//! Step-wrapper cache protocol.
//!
//! Cached step values are stored in the KV store wrapped in a small JSON
//! envelope, `{"cached":true,"value":<json>}`. The envelope is what lets a
//! cache lookup distinguish "never ran" (blob absent) from "ran and
//! legitimately produced null" (blob present, `value: null`). Without it,
//! a step returning nothing would re-execute on every retry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::error::{CoreError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct StepEnvelope {
    cached: bool,
    #[serde(default)]
    value: Value,
}

/// Outcome of a KV cache lookup for a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepLookup {
    /// The step completed before; `Value::Null` is a valid cached result.
    Hit(Value),
    /// No usable cache entry; the step must execute.
    Miss,
}

/// Wraps a step result for storage in the KV cache.
pub fn encode_step_value(value: &Value) -> Result<String> {
    let envelope = StepEnvelope {
        cached: true,
        value: value.clone(),
    };
    serde_json::to_string(&envelope).map_err(CoreError::Serialization)
}

/// Interprets a raw cache blob.
///
/// Absent or empty blobs are misses. A blob that fails to parse is
/// treated as a miss and logged rather than failing the execution: the
/// step simply re-runs and overwrites the bad entry.
pub fn decode_step_blob(blob: Option<&str>) -> StepLookup {
    let Some(raw) = blob else {
        return StepLookup::Miss;
    };
    if raw.is_empty() {
        return StepLookup::Miss;
    }
    match serde_json::from_str::<StepEnvelope>(raw) {
        Ok(envelope) if envelope.cached => StepLookup::Hit(envelope.value),
        Ok(_) => StepLookup::Miss,
        Err(e) => {
            warn!("unparseable step cache blob, treating as miss: {}", e);
            StepLookup::Miss
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_preserves_value() {
        for value in [
            Value::Null,
            json!(0),
            json!(""),
            json!(false),
            json!({}),
            json!([1, 2, 3]),
            json!({"nested": {"deep": null}}),
        ] {
            let blob = encode_step_value(&value).unwrap();
            assert_eq!(decode_step_blob(Some(&blob)), StepLookup::Hit(value));
        }
    }

    #[test]
    fn test_absent_and_empty_are_misses() {
        assert_eq!(decode_step_blob(None), StepLookup::Miss);
        assert_eq!(decode_step_blob(Some("")), StepLookup::Miss);
    }

    #[test]
    fn test_cached_null_is_a_hit() {
        let blob = encode_step_value(&Value::Null).unwrap();
        assert_eq!(decode_step_blob(Some(&blob)), StepLookup::Hit(Value::Null));
    }

    #[test]
    fn test_garbage_is_a_miss() {
        assert_eq!(decode_step_blob(Some("not json")), StepLookup::Miss);
        assert_eq!(decode_step_blob(Some("{\"cached\":false}")), StepLookup::Miss);
        assert_eq!(decode_step_blob(Some("{\"value\":42}")), StepLookup::Miss);
    }
}
