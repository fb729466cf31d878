//! Raw record <-> envelope conversion.
//!
//! Providers and callers hand the runtime raw JSON (a single record or an
//! array of records). Everything past this module works on typed
//! [`EventEnvelope`]s.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use thiserror::Error;

use cairn_core::{Entity, EntityId, RequestId};

use crate::envelope::{EnvelopeKind, EventEnvelope};
use crate::event::Event;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("expected a JSON object or array of objects, found {0}")]
    UnexpectedShape(&'static str),

    #[error("record {index} is not a valid envelope: {source}")]
    InvalidEnvelope {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {index} is missing `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("payload of `{type_name}` could not be converted: {source}")]
    Payload {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn shape_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Decode a raw batch: either one envelope object or an array of them.
pub fn decode_raw(raw: &JsonValue) -> Result<Vec<EventEnvelope>, CodecError> {
    let records: Vec<&JsonValue> = match raw {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(_) => vec![raw],
        other => return Err(CodecError::UnexpectedShape(shape_name(other))),
    };

    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| decode_record(index, record))
        .collect()
}

/// Same as [`decode_raw`], from a JSON string.
pub fn decode_raw_str(raw: &str) -> Result<Vec<EventEnvelope>, CodecError> {
    let value: JsonValue = serde_json::from_str(raw)?;
    decode_raw(&value)
}

fn decode_record(index: usize, record: &JsonValue) -> Result<EventEnvelope, CodecError> {
    if !record.is_object() {
        return Err(CodecError::UnexpectedShape(shape_name(record)));
    }

    let envelope: EventEnvelope = serde_json::from_value(record.clone())
        .map_err(|source| CodecError::InvalidEnvelope { index, source })?;

    if envelope.entity_type_name.trim().is_empty() {
        return Err(CodecError::MissingField {
            index,
            field: "entityTypeName",
        });
    }
    if envelope.entity_id.as_str().trim().is_empty() {
        return Err(CodecError::MissingField {
            index,
            field: "entityID",
        });
    }
    if envelope.type_name.trim().is_empty() {
        return Err(CodecError::MissingField {
            index,
            field: "typeName",
        });
    }

    Ok(envelope)
}

/// Encode envelopes back into the raw array form.
pub fn encode(envelopes: &[EventEnvelope]) -> Result<JsonValue, CodecError> {
    Ok(serde_json::to_value(envelopes)?)
}

/// Deserialize an envelope's payload into a typed value.
pub fn decode_value<T: DeserializeOwned>(envelope: &EventEnvelope) -> Result<T, CodecError> {
    serde_json::from_value(envelope.value.clone()).map_err(|source| CodecError::Payload {
        type_name: envelope.type_name.clone(),
        source,
    })
}

pub(crate) fn encode_value<T: Serialize>(type_name: &str, value: &T) -> Result<JsonValue, CodecError> {
    serde_json::to_value(value).map_err(|source| CodecError::Payload {
        type_name: type_name.to_string(),
        source,
    })
}

impl EventEnvelope {
    /// Wrap a typed event into an unstored envelope (`version = 0`).
    pub fn event<E: Event>(event: &E, request_id: RequestId) -> Result<Self, CodecError> {
        Ok(Self {
            entity_type_name: <E::Entity as Entity>::TYPE_NAME.to_string(),
            entity_id: event.entity_id(),
            kind: EnvelopeKind::Event,
            type_name: E::TYPE_NAME.to_string(),
            value: encode_value(E::TYPE_NAME, event)?,
            version: 0,
            created_at: Utc::now(),
            request_id,
            snapshotted_event_created_at: None,
        })
    }

    /// Build a snapshot envelope from already-folded JSON state.
    pub fn snapshot_value(
        entity_type_name: impl Into<String>,
        entity_id: EntityId,
        value: JsonValue,
        version: u64,
        request_id: RequestId,
        snapshotted_event_created_at: Option<DateTime<Utc>>,
    ) -> Self {
        let entity_type_name = entity_type_name.into();
        Self {
            type_name: entity_type_name.clone(),
            entity_type_name,
            entity_id,
            kind: EnvelopeKind::Snapshot,
            value,
            version,
            created_at: Utc::now(),
            request_id,
            snapshotted_event_created_at,
        }
    }

    /// Build a snapshot envelope from typed entity state.
    pub fn snapshot<S: Entity>(
        state: &S,
        version: u64,
        request_id: RequestId,
        snapshotted_event_created_at: Option<DateTime<Utc>>,
    ) -> Result<Self, CodecError> {
        Ok(Self::snapshot_value(
            S::TYPE_NAME,
            state.id().clone(),
            encode_value(S::TYPE_NAME, state)?,
            version,
            request_id,
            snapshotted_event_created_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_event(id: &str, version: u64) -> JsonValue {
        json!({
            "entityTypeName": "Cart",
            "entityID": id,
            "kind": "event",
            "typeName": "CartItemChanged",
            "value": { "cartId": id, "productId": "p1", "quantity": 2 },
            "version": version,
            "createdAt": "2024-03-01T10:00:00Z",
            "requestID": "req-1"
        })
    }

    #[test]
    fn decodes_single_object_and_arrays() {
        let one = decode_raw(&raw_event("c1", 1)).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].entity_id.as_str(), "c1");
        assert!(one[0].is_event());

        let many = decode_raw(&json!([raw_event("c1", 1), raw_event("c2", 1)])).unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].stream_key().to_string(), "Cart/c2");
    }

    #[test]
    fn rejects_scalars_and_non_object_items() {
        assert!(matches!(decode_raw(&json!(42)), Err(CodecError::UnexpectedShape("a number"))));
        assert!(matches!(
            decode_raw(&json!([raw_event("c1", 1), "oops"])),
            Err(CodecError::UnexpectedShape("a string"))
        ));
    }

    #[test]
    fn reports_index_of_broken_record() {
        let mut broken = raw_event("c1", 1);
        broken["kind"] = json!("weird");
        let err = decode_raw(&json!([raw_event("c0", 1), broken])).unwrap_err();
        assert!(matches!(err, CodecError::InvalidEnvelope { index: 1, .. }));
    }

    #[test]
    fn rejects_blank_identity_fields() {
        let mut blank = raw_event("c1", 1);
        blank["entityID"] = json!("");
        assert!(matches!(
            decode_raw(&blank),
            Err(CodecError::MissingField { field: "entityID", .. })
        ));
    }

    #[test]
    fn version_defaults_to_zero_for_unstored_records() {
        let mut raw = raw_event("c1", 1);
        raw.as_object_mut().unwrap().remove("version");
        let decoded = decode_raw(&raw).unwrap();
        assert_eq!(decoded[0].version, 0);
    }

    #[test]
    fn encode_keeps_wire_field_names() {
        let decoded = decode_raw_str(&raw_event("c1", 3).to_string()).unwrap();
        let encoded = encode(&decoded).unwrap();
        assert_eq!(encoded[0]["entityID"], json!("c1"));
        assert_eq!(encoded[0]["requestID"], json!("req-1"));
        assert_eq!(encoded[0]["version"], json!(3));
        assert!(encoded[0].get("snapshottedEventCreatedAt").is_none());
    }
}
