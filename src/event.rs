//! Normalized activity events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A validated user-activity event.
///
/// Immutable once the normalizer has built it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub entity_id: String,
    /// When the activity happened, as reported by the producer.
    pub timestamp: DateTime<Utc>,
    /// When this process normalized the record.
    pub processed_at: DateTime<Utc>,
    /// Every other field of the raw record, untouched.
    pub payload: Map<String, Value>,
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
