use serde::Deserialize;

use crate::models::OutboxRecord;
use super::{EventEnvelope, Topic};

// ============================================================================
// Event Codec
// ============================================================================
//
// JSON envelope stored in `outbox.payload`:
//
//   {"schema_version":1,"event_id":"...","occurred_at":"...",
//    "event":{"type":"user.created","data":{...}}}
//
// Encoding is deterministic (struct field order, role sets are ordered).
// Decoding checks the schema version before touching the body and refuses
// anything it does not understand instead of guessing. Unknown fields are
// an error: re-encoding would otherwise drop them on the way to the broker.
//
// ============================================================================

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed event payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unsupported schema version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Record topic {record} does not match event topic {event}")]
    TopicMismatch { record: String, event: Topic },

    #[error("Record key {record} does not match event key {event}")]
    KeyMismatch { record: i64, event: i64 },
}

#[derive(Deserialize)]
struct VersionHeader {
    schema_version: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventCodec;

impl EventCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, envelope: &EventEnvelope) -> Result<String, CodecError> {
        serde_json::to_string(envelope).map_err(CodecError::Encode)
    }

    pub fn decode(&self, payload: &str) -> Result<EventEnvelope, CodecError> {
        let header: VersionHeader = serde_json::from_str(payload).map_err(CodecError::Malformed)?;
        if header.schema_version != SCHEMA_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: header.schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        serde_json::from_str(payload).map_err(CodecError::Malformed)
    }

    /// Decode an outbox row and check that its routing columns agree with
    /// the event inside it.
    pub fn decode_record(&self, record: &OutboxRecord) -> Result<EventEnvelope, CodecError> {
        let topic: Topic = record.topic.parse()?;
        let envelope = self.decode(&record.payload)?;

        if envelope.topic() != topic {
            return Err(CodecError::TopicMismatch {
                record: record.topic.clone(),
                event: envelope.topic(),
            });
        }
        if envelope.key() != record.key {
            return Err(CodecError::KeyMismatch {
                record: record.key,
                event: envelope.key(),
            });
        }

        Ok(envelope)
    }
}
