use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Collections read by the dashboard. Renaming any of them breaks it.
pub const SENSOR_READINGS: &str = "sensor_readings";
pub const DEVICES_LATEST: &str = "devices_latest";
pub const ALERTS: &str = "alerts";
pub const DEVICE_HEARTBEATS: &str = "device_heartbeats";
pub const UNKNOWN_MESSAGES: &str = "unknown_messages";

/// Fallback used when a payload carries no `device_id`.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Placeholder for ids the store assigns itself (used in error reports).
pub const GENERATED_ID: &str = "<generated>";

const PREVIEW_CHARS: usize = 256;

/// Decoded payload plus the `received_at` and `topic` fields injected on receipt.
pub type NormalizedRecord = Map<String, Value>;

/// One message as delivered by the broker.
///
/// `receipt_time` is stamped locally at delivery; the sender's clock is never
/// trusted for it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub raw_payload: Vec<u8>,
    pub receipt_time: OffsetDateTime,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, raw_payload: impl Into<Vec<u8>>) -> Self {
        Self::received_at(topic, raw_payload, OffsetDateTime::now_utc())
    }

    pub fn received_at(
        topic: impl Into<String>,
        raw_payload: impl Into<Vec<u8>>,
        receipt_time: OffsetDateTime,
    ) -> Self {
        Self {
            topic: topic.into(),
            raw_payload: raw_payload.into(),
            receipt_time,
        }
    }

    /// Lossy, truncated rendering of the payload for log lines.
    pub fn payload_preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.raw_payload);
        if text.chars().count() <= PREVIEW_CHARS {
            return text.into_owned();
        }
        let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
        preview.push_str("...");
        preview
    }
}

/// Routing class of a topic, decided by exact match against the configured topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    SensorData,
    Alert,
    Heartbeat,
    Unclassified,
}

/// What a successfully routed message was written as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Appended to `sensor_readings/{doc_id}` and projected to `devices_latest/{device_id}`.
    SensorReading { device_id: String, doc_id: String },
    /// Appended to `alerts/{id}`.
    Alert { id: String, alert_type: String },
    /// Overwrote `device_heartbeats/{device_id}`.
    Heartbeat { device_id: String },
    /// Appended to `unknown_messages/{id}`.
    Unclassified { id: String },
}

/// Renders a record field as a document-key component.
///
/// Strings are used verbatim, other scalars as their JSON text. A missing
/// field or an explicit `null` yields `None` so callers can apply their default.
pub fn key_part(record: &NormalizedRecord, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> NormalizedRecord {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test records are objects"),
        }
    }

    #[test]
    fn key_part_renders_strings_verbatim_and_numbers_as_json() {
        let r = record(json!({"device_id": "esp32-kitchen", "timestamp": 1700000000, "ratio": 0.5}));
        assert_eq!(key_part(&r, "device_id").as_deref(), Some("esp32-kitchen"));
        assert_eq!(key_part(&r, "timestamp").as_deref(), Some("1700000000"));
        assert_eq!(key_part(&r, "ratio").as_deref(), Some("0.5"));
    }

    #[test]
    fn key_part_treats_null_as_missing() {
        let r = record(json!({"device_id": null}));
        assert_eq!(key_part(&r, "device_id"), None);
        assert_eq!(key_part(&r, "timestamp"), None);
    }

    #[test]
    fn payload_preview_truncates_long_payloads() {
        let msg = InboundMessage::new("home/sensors/data", vec![b'x'; 1000]);
        let preview = msg.payload_preview();
        assert_eq!(preview.len(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));

        let short = InboundMessage::new("t", &b"{\"a\":1}"[..]);
        assert_eq!(short.payload_preview(), "{\"a\":1}");
    }
}
