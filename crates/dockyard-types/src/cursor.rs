//! Workflow-event pagination cursor (spec §6.7).
//!
//! Base64url-encoded JSON `{v: "v1", occurredAt, id}`. Any other shape, or
//! any version tag other than `"v1"`, decodes to `None` — no forward-
//! compatible best-effort decoding, per the Design Note in spec §9.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorPayload {
    v: String,
    #[serde(rename = "occurredAt")]
    occurred_at: DateTime<Utc>,
    id: Uuid,
}

/// An event-pagination cursor pointing at `(occurred_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCursor {
    pub occurred_at: DateTime<Utc>,
    pub id: Uuid,
}

impl EventCursor {
    pub fn new(occurred_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { occurred_at, id }
    }

    /// Encode as a base64url string.
    pub fn encode(&self) -> String {
        let payload = CursorPayload {
            v: VERSION.to_string(),
            occurred_at: self.occurred_at,
            id: self.id,
        };
        let json = serde_json::to_vec(&payload).expect("cursor payload is always serializable");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a cursor string. Returns `None` for any malformed input,
    /// including a well-formed payload with a version other than `"v1"`.
    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(raw)
            .ok()?;
        let payload: CursorPayload = serde_json::from_slice(&bytes).ok()?;
        if payload.v != VERSION {
            return None;
        }
        Some(Self {
            occurred_at: payload.occurred_at,
            id: payload.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn roundtrips_valid_cursor() {
        let cursor = EventCursor::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(), Uuid::now_v7());
        let encoded = cursor.encode();
        let decoded = EventCursor::decode(&encoded).expect("should decode");
        assert_eq!(cursor, decoded);
    }

    #[test]
    fn rejects_garbage() {
        assert!(EventCursor::decode("not-valid-base64!!!").is_none());
    }

    #[test]
    fn rejects_wrong_version() {
        let payload = serde_json::json!({
            "v": "v2",
            "occurredAt": Utc::now(),
            "id": Uuid::now_v7(),
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        assert!(EventCursor::decode(&encoded).is_none());
    }

    #[test]
    fn rejects_truncated_json() {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"v\":\"v1\"");
        assert!(EventCursor::decode(&encoded).is_none());
    }
}
