use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire-level wrapper for every message crossing the broker.
///
/// Serialized as camelCase JSON text (`{"roomId": ..., "payload": ...,
/// "timestamp": ...}`) so all processes sharing the broker speak the
/// same format. The payload is opaque at this layer; collaborators who
/// know the concrete message shape (signaling offer/answer, chat text,
/// presence ping) do their own typing on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Opaque, caller-supplied room identifier.
    pub room_id: String,
    /// Opaque unit of data understood only by collaborators.
    pub payload: Value,
    /// Send time at the publisher, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Envelope {
    /// Wrap a payload for a room, stamping the current send time.
    #[must_use]
    pub fn new(room_id: impl Into<String>, payload: Value) -> Self {
        Self {
            room_id: room_id.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format_is_camel_case() {
        let envelope = Envelope {
            room_id: "room-42".to_string(),
            payload: json!({"kind": "offer", "sdp": "v=0"}),
            timestamp: 1_700_000_000_000,
        };

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"roomId\":\"room-42\""));
        assert!(json.contains("\"payload\""));
        assert!(json.contains("\"timestamp\":1700000000000"));
        assert!(!json.contains("room_id"));

        let decoded: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_new_stamps_millisecond_time() {
        let before = Utc::now().timestamp_millis();
        let envelope = Envelope::new("room-1", json!("ping"));
        let after = Utc::now().timestamp_millis();

        assert_eq!(envelope.room_id, "room-1");
        assert!(envelope.timestamp >= before && envelope.timestamp <= after);
    }
}
