//! Data-migration lifecycle entity.
//!
//! Every registry carries this entity. Its stream records when a named data
//! migration started and finished; its raw events are never exposed to
//! external readers.
//!
//! [`EntityMigrated`] is the one event that may land on any entity stream: it
//! carries the entity's state in its new shape and replaces whatever the fold
//! had built so far.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use cairn_core::{Entity, EntityId, RequestId};

use crate::authorization::deny_access;
use crate::codec::{CodecError, encode_value};
use crate::envelope::{EnvelopeKind, EventEnvelope, StreamKey};
use crate::event::Event;
use crate::registry::RegistryBuilder;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataMigrationStatus {
    Started,
    Finished,
}

/// State of one named data migration. The migration name is the entity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMigrationEntity {
    pub id: EntityId,
    pub status: DataMigrationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Entity for DataMigrationEntity {
    const TYPE_NAME: &'static str = "DataMigrationEntity";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMigrationStarted {
    pub name: EntityId,
    pub started_at: DateTime<Utc>,
}

impl Event for DataMigrationStarted {
    const TYPE_NAME: &'static str = "DataMigrationStarted";
    type Entity = DataMigrationEntity;

    fn entity_id(&self) -> EntityId {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMigrationFinished {
    pub name: EntityId,
    pub finished_at: DateTime<Utc>,
}

impl Event for DataMigrationFinished {
    const TYPE_NAME: &'static str = "DataMigrationFinished";
    type Entity = DataMigrationEntity;

    fn entity_id(&self) -> EntityId {
        self.name.clone()
    }
}

/// Rewrites one entity's state during a data migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMigrated {
    pub entity_type_name: String,
    #[serde(rename = "entityID")]
    pub entity_id: EntityId,
    pub new_value: JsonValue,
}

impl EntityMigrated {
    pub const TYPE_NAME: &'static str = "EntityMigrated";

    pub fn new<E: Entity>(migrated: &E) -> Result<Self, CodecError> {
        Ok(Self {
            entity_type_name: E::TYPE_NAME.to_string(),
            entity_id: migrated.id().clone(),
            new_value: encode_value(E::TYPE_NAME, migrated)?,
        })
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.entity_type_name.clone(), self.entity_id.clone())
    }

    /// Unstored event envelope on the migrated entity's own stream.
    pub fn into_envelope(self, request_id: RequestId) -> Result<EventEnvelope, CodecError> {
        Ok(EventEnvelope {
            entity_type_name: self.entity_type_name.clone(),
            entity_id: self.entity_id.clone(),
            kind: EnvelopeKind::Event,
            type_name: Self::TYPE_NAME.to_string(),
            value: encode_value(Self::TYPE_NAME, &self)?,
            version: 0,
            created_at: Utc::now(),
            request_id,
            snapshotted_event_created_at: None,
        })
    }
}

pub fn started(event: &DataMigrationStarted, _old: Option<&DataMigrationEntity>) -> DataMigrationEntity {
    DataMigrationEntity {
        id: event.name.clone(),
        status: DataMigrationStatus::Started,
        started_at: Some(event.started_at),
        finished_at: None,
    }
}

pub fn finished(event: &DataMigrationFinished, old: Option<&DataMigrationEntity>) -> DataMigrationEntity {
    DataMigrationEntity {
        id: event.name.clone(),
        status: DataMigrationStatus::Finished,
        started_at: old.and_then(|m| m.started_at),
        finished_at: Some(event.finished_at),
    }
}

pub(crate) fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .entity_with_authorizer::<DataMigrationEntity>(deny_access)
        .reducer::<DataMigrationStarted, _>("started", started)
        .reducer::<DataMigrationFinished, _>("finished", finished)
        .entity_migration(EntityMigrated::TYPE_NAME)
}
