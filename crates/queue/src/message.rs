use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header set by `dead_letter` describing why the message was parked.
pub const DEAD_LETTER_REASON: &str = "dead_letter_reason";
/// Header set by `dead_letter` with the RFC 3339 time of parking.
pub const DEAD_LETTERED_AT: &str = "dead_lettered_at";

/// Queue message envelope. The payload is opaque bytes (base64 on the wire,
/// matching how the envelope is stored in redis as JSON text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub queue: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// The exact envelope text this message was dequeued as. Bucket removal
    /// (`LREM`) matches on it, so the in-memory attempt bump cannot break
    /// removal. Not serialized.
    #[serde(skip)]
    pub(crate) raw: Option<String>,
}

impl Message {
    pub fn new(queue: &str, payload: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            payload,
            headers,
            attempts: 0,
            enqueued_at: Utc::now(),
            raw: None,
        }
    }
}

/// Bucket sizes for one named queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    /// Ready-bucket size; the queue's "size" for monitoring purposes.
    pub size: u64,
    pub processing: u64,
    pub dead_letter: u64,
}

mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64_STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        BASE64_STANDARD
            .decode(String::deserialize(d)?)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_with_binary_payload() {
        let msg = Message::new(
            "q",
            vec![0x00, 0xff, 0x10],
            HashMap::from([("k".to_string(), "v".to_string())]),
        );
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn payload_is_base64_on_the_wire() {
        let msg = Message::new("q", b"hello".to_vec(), HashMap::new());
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"], "aGVsbG8=");
    }
}
