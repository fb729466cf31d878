//! Entity reconstruction: fold events onto an optional snapshot.
//!
//! The fold is pure and deterministic. Given the same snapshot and the same
//! events it always produces the same state, which is what makes snapshots a
//! cache rather than a source of truth.

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::envelope::{EnvelopeKind, EventEnvelope, StreamKey};
use crate::migration::EntityMigrated;
use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum FoldError {
    #[error("event `{event_type_name}` is registered for `{registered_entity}`, not `{stream}`")]
    RegistryLookup {
        event_type_name: String,
        registered_entity: String,
        stream: StreamKey,
    },

    #[error("reducer `{reducer_name}` failed on `{event_type_name}` (version {version}): {source}")]
    Reducer {
        reducer_name: String,
        event_type_name: String,
        version: u64,
        #[source]
        source: serde_json::Error,
    },

    /// Versions must be contiguous. A gap means another writer got in between
    /// the snapshot read and the event read.
    #[error("non-contiguous version on {stream}: expected {expected}, found {found}")]
    VersionGap {
        stream: StreamKey,
        expected: u64,
        found: u64,
    },

    #[error("record for {found} (kind {kind:?}) does not belong to {stream}")]
    EntityMismatch {
        stream: StreamKey,
        found: StreamKey,
        kind: EnvelopeKind,
    },
}

/// Result of folding: the new snapshot plus how many events were applied on top
/// of the starting snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedEntity {
    pub snapshot: EventEnvelope,
    pub applied: usize,
}

/// Fold `events` (ascending, after `snapshot.version`) onto `snapshot`.
///
/// Returns `Ok(None)` when there is no snapshot and nothing produced state.
/// Events without a registered reducer are skipped (their version still counts).
/// Entity-migration events replace the state with their `newValue`.
pub fn fold_entity(
    registry: &Registry,
    stream: &StreamKey,
    snapshot: Option<&EventEnvelope>,
    events: &[EventEnvelope],
) -> Result<Option<FoldedEntity>, FoldError> {
    if let Some(snap) = snapshot {
        check_belongs(stream, snap)?;
    }

    let mut state: Option<JsonValue> = snapshot.map(|s| s.value.clone());
    let mut last_version = snapshot.map(|s| s.version).unwrap_or(0);
    let mut last_event: Option<&EventEnvelope> = None;
    let mut applied = 0usize;

    for event in events {
        check_belongs(stream, event)?;
        if !event.is_event() {
            return Err(FoldError::EntityMismatch {
                stream: stream.clone(),
                found: event.stream_key(),
                kind: event.kind,
            });
        }

        let expected = last_version + 1;
        if event.version != expected {
            return Err(FoldError::VersionGap {
                stream: stream.clone(),
                expected,
                found: event.version,
            });
        }
        last_version = event.version;
        last_event = Some(event);

        if registry.is_entity_migration(&event.type_name) {
            state = Some(migrated_state(stream, event)?);
            applied += 1;
            continue;
        }

        let Some(binding) = registry.reducer_for(&event.type_name) else {
            tracing::warn!(
                stream = %stream,
                event_type = %event.type_name,
                version = event.version,
                "no reducer registered for event type; skipping"
            );
            continue;
        };

        if binding.entity_type_name != stream.entity_type_name {
            return Err(FoldError::RegistryLookup {
                event_type_name: event.type_name.clone(),
                registered_entity: binding.entity_type_name.clone(),
                stream: stream.clone(),
            });
        }

        let next = (binding.reducer)(&event.value, state.as_ref()).map_err(|source| FoldError::Reducer {
            reducer_name: binding.reducer_name.clone(),
            event_type_name: event.type_name.clone(),
            version: event.version,
            source,
        })?;
        state = Some(next);
        applied += 1;
    }

    let Some(value) = state else {
        return Ok(None);
    };

    let snapshot = match (last_event, snapshot) {
        (Some(last), _) => EventEnvelope::snapshot_value(
            stream.entity_type_name.clone(),
            stream.entity_id.clone(),
            value,
            last_version,
            last.request_id.clone(),
            Some(last.created_at),
        ),
        (None, Some(existing)) => existing.clone(),
        // state is only Some if a snapshot or an event provided it
        (None, None) => return Ok(None),
    };

    Ok(Some(FoldedEntity { snapshot, applied }))
}

fn migrated_state(stream: &StreamKey, event: &EventEnvelope) -> Result<JsonValue, FoldError> {
    let migrated: EntityMigrated = serde_json::from_value(event.value.clone()).map_err(|source| FoldError::Reducer {
        reducer_name: "entity migration".to_string(),
        event_type_name: event.type_name.clone(),
        version: event.version,
        source,
    })?;
    if migrated.stream_key() != *stream {
        return Err(FoldError::EntityMismatch {
            stream: stream.clone(),
            found: migrated.stream_key(),
            kind: EnvelopeKind::Event,
        });
    }
    Ok(migrated.new_value)
}

fn check_belongs(stream: &StreamKey, envelope: &EventEnvelope) -> Result<(), FoldError> {
    if envelope.entity_type_name != stream.entity_type_name || envelope.entity_id != stream.entity_id {
        return Err(FoldError::EntityMismatch {
            stream: stream.clone(),
            found: envelope.stream_key(),
            kind: envelope.kind,
        });
    }
    Ok(())
}
