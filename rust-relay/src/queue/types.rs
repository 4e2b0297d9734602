//! Message types published to the updates queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content type of every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Inbound update wrapped with the time the relay received it.
///
/// Serializes as `{"update": ..., "received_at": "2024-01-01T00:00:00Z"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvelope<T> {
    pub update: T,
    pub received_at: DateTime<Utc>,
}

impl<T> UpdateEnvelope<T> {
    /// Wrap an update stamped with the current time.
    pub fn new(update: T) -> Self {
        Self::received_at(update, Utc::now())
    }

    pub fn received_at(update: T, received_at: DateTime<Utc>) -> Self {
        Self {
            update,
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    #[test]
    fn test_envelope_wire_shape() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let envelope = UpdateEnvelope::received_at(json!({"update_id": 9}), at);

        let value: Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["update"], json!({"update_id": 9}));
        assert_eq!(value["received_at"], "2024-05-01T12:30:00Z");
    }

    #[test]
    fn test_envelope_parses_received_at() {
        let raw = r#"{"update":{"update_id":3},"received_at":"2024-05-01T12:30:00.250Z"}"#;

        let parsed: UpdateEnvelope<Value> = serde_json::from_str(raw).unwrap();

        assert_eq!(parsed.update["update_id"], 3);
        assert_eq!(parsed.received_at.timestamp_subsec_millis(), 250);
    }
}
