//! Payload normalizer: raw bytes → JSON object with receipt metadata.
//!
//! Only the shape is checked (UTF-8, JSON, object at the top level). Missing
//! application fields such as `device_id` are the router's business.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::ProcessError;
use crate::models::{InboundMessage, NormalizedRecord};

pub const RECEIVED_AT_FIELD: &str = "received_at";
pub const TOPIC_FIELD: &str = "topic";

pub fn normalize(message: &InboundMessage) -> Result<NormalizedRecord, ProcessError> {
    let text = std::str::from_utf8(&message.raw_payload)?;
    let mut record = match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => map,
        other => return Err(ProcessError::NotAnObject(json_type_name(&other))),
    };

    // Local receipt metadata wins over anything the sender put in these fields.
    record.insert(
        RECEIVED_AT_FIELD.into(),
        Value::String(format_timestamp(message.receipt_time)),
    );
    record.insert(TOPIC_FIELD.into(), Value::String(message.topic.clone()));
    Ok(record)
}

/// RFC 3339 rendering used for `received_at`.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde_json::json;
    use time::macros::datetime;

    fn message(payload: &[u8]) -> InboundMessage {
        InboundMessage::received_at(
            "home/sensors/data",
            payload,
            datetime!(2024-03-01 12:30:45 UTC),
        )
    }

    #[test]
    fn injects_receipt_metadata() {
        let record = normalize(&message(br#"{"device_id":"sensor1","sensors":{"motion":true}}"#))
            .unwrap();
        assert_eq!(record["device_id"], "sensor1");
        assert_eq!(record["sensors"]["motion"], true);
        assert_eq!(record["received_at"], "2024-03-01T12:30:45Z");
        assert_eq!(record["topic"], "home/sensors/data");
    }

    #[test]
    fn sender_cannot_spoof_receipt_fields() {
        let record =
            normalize(&message(br#"{"received_at":"1999-01-01","topic":"forged"}"#)).unwrap();
        assert_eq!(record["received_at"], "2024-03-01T12:30:45Z");
        assert_eq!(record["topic"], "home/sensors/data");
    }

    #[test]
    fn empty_object_is_accepted() {
        let record = normalize(&message(b"{}")).unwrap();
        assert_eq!(Value::Object(record), json!({
            "received_at": "2024-03-01T12:30:45Z",
            "topic": "home/sensors/data",
        }));
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let err = normalize(&message(&[b'{', 0xC3, 0x28, b'}'])).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Decode);
    }

    #[test]
    fn truncated_json_is_malformed() {
        let err = normalize(&message(br#"{"device_id":"sensor1","#)).unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedPayload);
    }

    #[test]
    fn non_object_json_is_malformed() {
        let payloads: [&[u8]; 4] = [b"[1,2,3]", b"42", b"\"text\"", b"null"];
        for payload in payloads {
            let err = normalize(&message(payload)).unwrap_err();
            assert_eq!(err.kind(), FailureKind::MalformedPayload, "{payload:?}");
        }
        let err = normalize(&message(b"[1]")).unwrap_err();
        assert_eq!(err.to_string(), "payload is a JSON array, expected an object");
    }
}
