use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single event pulled from a vendor, ready to be forwarded.
///
/// The payload is opaque to the runtime: only `timestamp` and `fingerprint`
/// are read, and both are computed by the driver that produced the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub stream_key: String,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        stream_key: impl Into<String>,
        timestamp: DateTime<Utc>,
        fingerprint: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            timestamp,
            fingerprint: fingerprint.into(),
            payload,
        }
    }

    /// Build an event whose fingerprint is the SHA-256 of its payload.
    pub fn with_content_fingerprint(
        stream_key: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        let fingerprint = content_fingerprint(&payload);
        Self::new(stream_key, timestamp, fingerprint, payload)
    }

    /// The string pushed to the intake.
    ///
    /// String payloads are already serialized (raw log lines, vendor JSON
    /// kept verbatim) and are sent as-is.
    pub fn to_intake_string(&self) -> String {
        match &self.payload {
            serde_json::Value::String(raw) => raw.clone(),
            other => other.to_string(),
        }
    }
}

/// An event the driver could not turn into an [`Event`].
#[derive(Debug, Clone)]
pub struct RejectedEvent {
    pub fingerprint: Option<String>,
    pub reason: String,
}

impl RejectedEvent {
    pub fn new(fingerprint: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            fingerprint,
            reason: reason.into(),
        }
    }
}

/// Hex SHA-256 over the compact JSON encoding of a value.
///
/// serde_json keeps object keys sorted (no `preserve_order` feature), so
/// equal documents hash equally regardless of the vendor's key order.
pub fn content_fingerprint(value: &serde_json::Value) -> String {
    let encoded = value.to_string();
    format!("{:x}", Sha256::digest(encoded.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_fingerprint_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(content_fingerprint(&a), content_fingerprint(&b));
        assert_eq!(content_fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_intake_string_keeps_raw_strings() {
        let raw = Event::new("s", Utc::now(), "f", json!("<13>Jan 1 host app: hi"));
        assert_eq!(raw.to_intake_string(), "<13>Jan 1 host app: hi");

        let structured = Event::new("s", Utc::now(), "f", json!({"k": "v"}));
        assert_eq!(structured.to_intake_string(), r#"{"k":"v"}"#);
    }
}
