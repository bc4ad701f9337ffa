//! Structured record derived from one inbound message
//!
//! Devices publish either an envelope `{"time": ..., "Data": {...}}` or a bare
//! value. The envelope's `time` names the record and stamps it; `Data` becomes
//! the stored document. Anything else is stored as text, stamped with the
//! receive time.

use crate::identity::{ConnectionIdentity, InboundMessage};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record handed to the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub identity: ConnectionIdentity,
    pub topic: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub document: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Envelope {
    time: Value,
    #[serde(rename = "Data")]
    data: Value,
}

impl MessageRecord {
    pub fn from_inbound(message: &InboundMessage) -> Self {
        let envelope = serde_json::from_slice::<Value>(&message.payload)
            .ok()
            .filter(Value::is_object)
            .and_then(|value| serde_json::from_value::<Envelope>(value).ok());

        match envelope {
            Some(envelope) => {
                let time = match &envelope.time {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                Self {
                    identity: message.identity.clone(),
                    topic: message.topic.clone(),
                    title: format!("{}-{}", message.topic, time),
                    timestamp: parse_timestamp(&time).unwrap_or(message.received_at),
                    document: envelope.data.to_string(),
                    received_at: message.received_at,
                }
            }
            None => Self {
                identity: message.identity.clone(),
                topic: message.topic.clone(),
                title: format!("{}-{}", message.topic, message.received_at.to_rfc3339()),
                timestamp: message.received_at,
                document: String::from_utf8_lossy(&message.payload).into_owned(),
                received_at: message.received_at,
            },
        }
    }
}

/// RFC 3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn inbound(topic: &str, payload: &'static str) -> InboundMessage {
        InboundMessage::new(
            ConnectionIdentity::new("b1").unwrap(),
            topic,
            Bytes::from_static(payload.as_bytes()),
        )
    }

    #[test]
    fn test_envelope_payload() {
        let message = inbound(
            "plc/line-1",
            r#"{"time":"2024-05-01T08:30:00Z","Data":{"temp":23.5}}"#,
        );

        let record = MessageRecord::from_inbound(&message);

        assert_eq!(record.title, "plc/line-1-2024-05-01T08:30:00Z");
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
        );
        assert_eq!(record.document, r#"{"temp":23.5}"#);
        assert_eq!(record.identity.as_str(), "b1");
    }

    #[test]
    fn test_envelope_with_plain_datetime() {
        let message = inbound("plc/line-1", r#"{"time":"2024-05-01 08:30:00","Data":[1,2]}"#);
        let record = MessageRecord::from_inbound(&message);
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
        );
        assert_eq!(record.document, "[1,2]");
    }

    #[test]
    fn test_unparseable_time_falls_back_to_receive_time() {
        let message = inbound("plc/line-1", r#"{"time":"yesterday","Data":{}}"#);
        let record = MessageRecord::from_inbound(&message);
        assert_eq!(record.title, "plc/line-1-yesterday");
        assert_eq!(record.timestamp, message.received_at);
    }

    #[test]
    fn test_bare_value_payload() {
        let message = inbound("sensors/7/temp", "23.5");
        let record = MessageRecord::from_inbound(&message);
        assert_eq!(record.topic, "sensors/7/temp");
        assert_eq!(record.document, "23.5");
        assert_eq!(record.timestamp, message.received_at);
        assert!(record.title.starts_with("sensors/7/temp-"));
    }

    #[test]
    fn test_object_without_envelope_fields_is_stored_verbatim() {
        let message = inbound("sensors/7/temp", r#"{"temp":23.5}"#);
        let record = MessageRecord::from_inbound(&message);
        assert_eq!(record.document, r#"{"temp":23.5}"#);
    }

    #[test]
    fn test_binary_payload_is_lossy() {
        let message = InboundMessage::new(
            ConnectionIdentity::new("b1").unwrap(),
            "raw",
            Bytes::from_static(&[0xff, b'o', b'k']),
        );
        let record = MessageRecord::from_inbound(&message);
        assert!(record.document.ends_with("ok"));
    }
}
