//! Wire format for motion events delivered by the transport ingress.
//!
//! One envelope per dispatcher invocation:
//!
//! ```json
//! { "sensorId": "bathroom_main", "event": "motion_detected",
//!   "timestamp": 1704412800, "metadata": { "batteryLevel": 85 } }
//! ```
//!
//! `timestamp` is optional and accepts epoch seconds or an ISO-8601 string.
//! Extra `metadata` fields are preserved verbatim for the audit record.

use crate::model::EventType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionEnvelope {
    pub sensor_id: String,
    #[serde(rename = "event", default = "default_event_type")]
    pub event_type: EventType,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

const fn default_event_type() -> EventType {
    EventType::MotionDetected
}

impl MotionEnvelope {
    #[must_use]
    pub fn battery_level(&self) -> Option<i64> {
        self.metadata.get("batteryLevel").and_then(serde_json::Value::as_i64)
    }

    #[must_use]
    pub fn signal_strength(&self) -> Option<i64> {
        self.metadata
            .get("signalStrength")
            .and_then(serde_json::Value::as_i64)
    }

    #[must_use]
    pub fn firmware_version(&self) -> Option<String> {
        self.metadata
            .get("firmwareVersion")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
    }
}

/// Accept `1704412800`, `1704412800.5`, or `"2024-01-04T23:20:00Z"`.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Epoch(i64),
        EpochFloat(f64),
        Iso(String),
    }

    let Some(raw) = Option::<Raw>::deserialize(deserializer)? else {
        return Ok(None);
    };

    let parsed = match raw {
        Raw::Epoch(secs) => DateTime::from_timestamp(secs, 0),
        #[allow(clippy::cast_possible_truncation)]
        Raw::EpochFloat(secs) => DateTime::from_timestamp(secs as i64, 0),
        Raw::Iso(text) => DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
    };

    parsed.map(Some).ok_or_else(|| {
        serde::de::Error::custom("timestamp must be epoch seconds or an ISO-8601 datetime")
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_epoch_timestamp() {
        let envelope: MotionEnvelope = serde_json::from_str(
            r#"{"sensorId":"bathroom_main","event":"motion_detected","timestamp":1704412800}"#,
        )
        .unwrap();
        assert_eq!(envelope.sensor_id, "bathroom_main");
        assert_eq!(envelope.event_type, EventType::MotionDetected);
        assert_eq!(envelope.timestamp.unwrap().timestamp(), 1_704_412_800);
    }

    #[test]
    fn test_parse_iso_timestamp() {
        let envelope: MotionEnvelope = serde_json::from_str(
            r#"{"sensorId":"s-1","timestamp":"2024-01-04T23:20:00Z"}"#,
        )
        .unwrap();
        assert_eq!(envelope.timestamp.unwrap().timestamp(), 1_704_410_400);
    }

    #[test]
    fn test_timestamp_is_optional() {
        let envelope: MotionEnvelope =
            serde_json::from_str(r#"{"sensorId":"s-1"}"#).unwrap();
        assert!(envelope.timestamp.is_none());
        assert_eq!(envelope.event_type, EventType::MotionDetected);
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let result: Result<MotionEnvelope, _> =
            serde_json::from_str(r#"{"sensorId":"s-1","timestamp":"yesterday"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_metadata_telemetry_accessors() {
        let envelope: MotionEnvelope = serde_json::from_str(
            r#"{"sensorId":"s-1","metadata":{"batteryLevel":85,"signalStrength":-45,"firmwareVersion":"1.4.2","extra":true}}"#,
        )
        .unwrap();
        assert_eq!(envelope.battery_level(), Some(85));
        assert_eq!(envelope.signal_strength(), Some(-45));
        assert_eq!(envelope.firmware_version().as_deref(), Some("1.4.2"));
        assert!(envelope.metadata.contains_key("extra"));
    }

    #[test]
    fn test_heartbeat_event_type() {
        let envelope: MotionEnvelope =
            serde_json::from_str(r#"{"sensorId":"s-1","event":"heartbeat"}"#).unwrap();
        assert_eq!(envelope.event_type, EventType::Heartbeat);
    }
}
