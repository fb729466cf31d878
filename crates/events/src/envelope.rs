use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use cairn_core::{EntityId, RequestId};

/// Whether a persisted record is an event or a cached fold result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Event,
    Snapshot,
}

/// Identity of one entity stream: `(entityTypeName, entityID)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamKey {
    pub entity_type_name: String,
    #[serde(rename = "entityID")]
    pub entity_id: EntityId,
}

impl StreamKey {
    pub fn new(entity_type_name: impl Into<String>, entity_id: EntityId) -> Self {
        Self {
            entity_type_name: entity_type_name.into(),
            entity_id,
        }
    }
}

impl core::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.entity_type_name, self.entity_id)
    }
}

/// The unit persisted to (and read from) an entity stream.
///
/// Notes:
/// - `(entity_type_name, entity_id, version)` identifies one position in a stream.
/// - `kind = Snapshot` records carry folded entity state in `value`; they are a
///   cache and can always be rebuilt by replaying the stream from the start.
/// - For events, `type_name` is the event type; for snapshots it is the entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub entity_type_name: String,
    #[serde(rename = "entityID")]
    pub entity_id: EntityId,
    pub kind: EnvelopeKind,
    pub type_name: String,
    pub value: JsonValue,

    /// Position in the entity stream. Assigned by the event store on append;
    /// `0` on envelopes that have not been stored yet.
    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
    #[serde(rename = "requestID")]
    pub request_id: RequestId,

    /// For snapshots: creation time of the last event folded into `value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshotted_event_created_at: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.entity_type_name.clone(), self.entity_id.clone())
    }

    pub fn is_event(&self) -> bool {
        self.kind == EnvelopeKind::Event
    }

    pub fn is_snapshot(&self) -> bool {
        self.kind == EnvelopeKind::Snapshot
    }
}
