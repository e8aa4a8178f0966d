//! Normalized event envelope (spec §4.E): `{id, type, source, occurredAt,
//! payload, correlationId}`. Raw producer payloads arrive as arbitrary JSON;
//! `EventEnvelope::normalize` fills in every field the rest of the scheduler
//! relies on being present, the way `everruns-storage` assigns a UUID v7 to
//! any record it persists that the caller didn't already key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
    pub correlation_id: Option<String>,
}

impl EventEnvelope {
    /// Normalizes a raw producer payload into a well-formed envelope.
    /// Missing `id` gets a fresh UUIDv7 (time-ordered, matching the rest of
    /// the schema's ID convention). Missing `occurredAt` defaults to `now`.
    /// `source` is the only field with no sane default: an envelope with no
    /// source cannot be rate-limited or matched against triggers, so it is
    /// rejected.
    pub fn normalize(raw: Value, now: DateTime<Utc>) -> Result<Self, String> {
        let source = raw
            .get("source")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "event envelope missing required field `source`".to_string())?;

        let event_type = raw
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "unknown".to_string());

        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::now_v7);

        let occurred_at = raw
            .get("occurredAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);

        let correlation_id = raw
            .get("correlationId")
            .and_then(Value::as_str)
            .map(str::to_string);

        let payload = raw.get("payload").cloned().unwrap_or(Value::Null);

        Ok(Self {
            id,
            event_type,
            source,
            occurred_at,
            payload,
            correlation_id,
        })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("EventEnvelope always serializes")
    }
}
