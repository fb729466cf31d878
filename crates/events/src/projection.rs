//! Read-model concepts shared by the registry and the projection engine.
//!
//! A read model is a denormalized view derived from entity state. Read models
//! are **disposable**: they can be cleared and rebuilt from the event streams at
//! any time.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use cairn_core::EntityId;

/// A read model type.
pub trait ReadModel: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable read model name (e.g. "CartReadModel").
    const TYPE_NAME: &'static str;
}

/// What a projection function wants done with a read-model record.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionResult<R> {
    /// Write this value (create or replace).
    Upsert(R),
    /// Remove the record.
    Delete,
    /// Leave the record untouched.
    Nothing,
}

impl<R> ProjectionResult<R> {
    pub fn map<T>(self, f: impl FnOnce(R) -> T) -> ProjectionResult<T> {
        match self {
            ProjectionResult::Upsert(value) => ProjectionResult::Upsert(f(value)),
            ProjectionResult::Delete => ProjectionResult::Delete,
            ProjectionResult::Nothing => ProjectionResult::Nothing,
        }
    }

    pub fn try_map<T, E>(self, f: impl FnOnce(R) -> Result<T, E>) -> Result<ProjectionResult<T>, E> {
        Ok(match self {
            ProjectionResult::Upsert(value) => ProjectionResult::Upsert(f(value)?),
            ProjectionResult::Delete => ProjectionResult::Delete,
            ProjectionResult::Nothing => ProjectionResult::Nothing,
        })
    }
}

/// Sequence component of a read-model key (for read models keyed by `(id, sequence)`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    pub name: String,
    pub value: String,
}

/// Key of one read-model record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReadModelKey {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceKey>,
}

impl ReadModelKey {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.sequence = Some(SequenceKey {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

impl core::fmt::Display for ReadModelKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.sequence {
            Some(seq) => write!(f, "{}[{}={}]", self.id, seq.name, seq.value),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A read (or pre-write) request against one read model.
///
/// Before-hooks receive and return this value, so they can rewrite the key or
/// the filters. Exactly one of `key` / `filters` is normally set: projections
/// always set `key`, external searches set `filters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModelRequest {
    pub read_model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ReadModelKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<JsonValue>,
}

impl ReadModelRequest {
    pub fn by_key(read_model_name: impl Into<String>, key: ReadModelKey) -> Self {
        Self {
            read_model_name: read_model_name.into(),
            key: Some(key),
            filters: None,
        }
    }

    pub fn by_filters(read_model_name: impl Into<String>, filters: JsonValue) -> Self {
        Self {
            read_model_name: read_model_name.into(),
            key: None,
            filters: Some(filters),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Upserted,
    Deleted,
}

/// Notification emitted after a read-model record was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModelChange {
    pub read_model_name: String,
    pub key: ReadModelKey,
    pub kind: ChangeKind,
    /// Record version after the write (the deleted version for deletions).
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}
