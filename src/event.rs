//! Recorded and proposed event types shared by the chronicler, the merge
//! iterator and reaction code.
//!
//! Domain events use adjacently tagged serde (`#[serde(tag = "type", content =
//! "data")]`). The tag travels as [`RecordedEvent::event_type`] and the content
//! as [`RecordedEvent::payload`], so decoding into a projection's event enum is
//! a single `serde_json::from_value` call resolved by variant, never by
//! matching type-name strings in user code.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An event as stored in a stream and delivered to projections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Name of the stream holding the event.
    pub stream_name: String,
    /// Store-assigned position within the stream, starting at 1.
    ///
    /// Positions are contiguous per stream once every writer has committed;
    /// a hole seen by a reader is a gap.
    pub position: u64,
    /// Event type tag (e.g. `"Deposited"`).
    pub event_type: String,
    /// Event data (the `"data"` half of the tagged domain event).
    pub payload: Value,
    /// Free-form metadata (correlation IDs, actor, ...).
    pub metadata: Value,
    /// Time the event was recorded; drives multi-stream ordering.
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Build a recorded event with a fresh UUID v4 and empty metadata.
    pub fn new(
        stream_name: impl Into<String>,
        position: u64,
        event_type: impl Into<String>,
        payload: Value,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            stream_name: stream_name.into(),
            position,
            event_type: event_type.into(),
            payload,
            metadata: Value::Null,
            recorded_at,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Decode into an adjacently tagged domain event enum.
    ///
    /// Returns `None` when the type tag is unknown to `E` or the payload does
    /// not match the variant, so projections stay forward compatible with
    /// event types added after they were written.
    pub fn decode<E: DeserializeOwned>(&self) -> Option<E> {
        let tagged = if self.payload.is_null() {
            serde_json::json!({ "type": self.event_type })
        } else {
            serde_json::json!({
                "type": self.event_type,
                "data": self.payload,
            })
        };
        serde_json::from_value(tagged).ok()
    }
}

/// An event waiting to be appended to a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Newly generated UUID v4 event ID.
    pub event_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// Event data.
    pub payload: Value,
    /// Free-form metadata.
    pub metadata: Value,
}

impl ProposedEvent {
    /// Build a proposed event from raw parts.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            metadata: Value::Null,
        }
    }

    /// Encode an adjacently tagged domain event.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the event cannot be serialized or does
    /// not serialize to an object with a string `"type"` field.
    pub fn from_domain<E: Serialize>(event: &E) -> serde_json::Result<Self> {
        use serde::ser::Error as _;

        let value = serde_json::to_value(event)?;
        let obj = value.as_object().ok_or_else(|| {
            serde_json::Error::custom("domain event must serialize to a JSON object")
        })?;
        let event_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| serde_json::Error::custom("domain event is missing a string 'type' tag"))?
            .to_string();
        // Unit variants carry no "data" field.
        let payload = obj.get("data").cloned().unwrap_or(Value::Null);
        Ok(Self::new(event_type, payload))
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Stamp the proposal with its stream, position and recording time.
    pub fn record(
        self,
        stream_name: impl Into<String>,
        position: u64,
        recorded_at: DateTime<Utc>,
    ) -> RecordedEvent {
        RecordedEvent {
            event_id: self.event_id,
            stream_name: stream_name.into(),
            position,
            event_type: self.event_type,
            payload: self.payload,
            metadata: self.metadata,
            recorded_at,
        }
    }
}
