use serde::{Deserialize, Serialize};

/// Event type published by input adapters: `{text, sessionId?, source?}`.
pub const INPUT_EVENT: &str = "input";
/// Event type consumed by output adapters: `{text, intent, entities, success, sessionId}`.
pub const RESPONSE_EVENT: &str = "response";
/// Published after a session changes mode: `{sessionId, from, to}`.
pub const MODE_CHANGED_EVENT: &str = "mode_changed";

/// A published event. Immutable once enqueued on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub emitted_at_ms: i64,
}

impl Event {
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            payload,
            emitted_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Read a string field from the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}
