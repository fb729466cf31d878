//! Read-model projection engine.
//!
//! For every projection bound to an entity type, the engine derives the read
//! model key(s) from the entity state, runs the read model's before-hooks,
//! recomputes the record and writes it back with a compare-and-swap on the
//! record version. Stale writes redo the whole fetch/project/write cycle.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::instrument;

use cairn_core::{EntityId, ExpectedVersion};
use cairn_events::{
    ChangeKind, EventEnvelope, HookError, ProjectionBinding, ProjectionResult, ReadModelChange, ReadModelKey,
    ReadModelRequest, Registry,
};

use crate::event_store::{EventStore, EventStoreError, EventStoreProvider, Pagination};
use crate::read_model::{ReadModelRecord, ReadModelStoreError, ReadModelStoreProvider};
use crate::retry::{RetryError, RetryPolicy, retry_if};

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The record kept changing under us until the retry policy gave up.
    #[error("read model {read_model_name}/{key} still stale after {attempts} attempts")]
    ReadModelConcurrency {
        read_model_name: String,
        key: ReadModelKey,
        attempts: u32,
    },

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("projection `{projection_name}` onto `{read_model_name}` failed: {reason}")]
    Projection {
        projection_name: String,
        read_model_name: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] ReadModelStoreError),

    #[error("registry lookup failed: {0}")]
    RegistryLookup(String),
}

impl ProjectionError {
    fn is_stale_write(&self) -> bool {
        matches!(self, ProjectionError::Store(err) if err.is_concurrency())
    }
}

/// A failed read-model instance. Other instances of the same run are unaffected.
#[derive(Debug)]
pub struct ProjectionFailure {
    pub read_model_name: String,
    pub projection_name: String,
    pub key: ReadModelKey,
    pub error: ProjectionError,
}

#[derive(Debug, Default)]
pub struct ProjectionOutcome {
    pub changes: Vec<ReadModelChange>,
    pub failures: Vec<ProjectionFailure>,
}

impl ProjectionOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: ProjectionOutcome) {
        self.changes.extend(other.changes);
        self.failures.extend(other.failures);
    }
}

/// Result of refreshing one entity: its latest snapshot and the read-model work done with it.
#[derive(Debug, Default)]
pub struct EntityRefresh {
    pub snapshot: Option<EventEnvelope>,
    pub outcome: ProjectionOutcome,
}

pub struct ProjectionEngine<R> {
    store: R,
    registry: Arc<Registry>,
    retry: RetryPolicy,
}

impl<R> ProjectionEngine<R>
where
    R: ReadModelStoreProvider,
{
    pub fn new(store: R, registry: Arc<Registry>, retry: RetryPolicy) -> Self {
        Self { store, registry, retry }
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    /// Run every projection bound to the snapshot's entity type.
    #[instrument(skip(self, snapshot), fields(entity_type = %snapshot.entity_type_name, entity_id = %snapshot.entity_id, version = snapshot.version))]
    pub async fn project_entity(&self, snapshot: &EventEnvelope) -> ProjectionOutcome {
        let mut outcome = ProjectionOutcome::default();

        for binding in self.registry.projections_for(&snapshot.entity_type_name) {
            for key in self.derived_keys(binding, &snapshot.value) {
                match self.project_one(binding, &snapshot.value, key.clone()).await {
                    Ok(Some(change)) => outcome.changes.push(change),
                    Ok(None) => {}
                    Err(error) => outcome.failures.push(failure(binding, key, error)),
                }
            }
        }

        outcome
    }

    /// Record keys a projection targets for this entity state. Empty when the
    /// join key (or the read model's sequence value) is missing.
    fn derived_keys(&self, binding: &ProjectionBinding, entity: &JsonValue) -> Vec<ReadModelKey> {
        let ids = join_key_values(entity, &binding.join_key);
        if ids.is_empty() {
            tracing::debug!(
                read_model = %binding.read_model_name,
                join_key = %binding.join_key,
                "join key missing on entity; skipping projection"
            );
            return Vec::new();
        }

        let sequence_key = self
            .registry
            .read_model(&binding.read_model_name)
            .and_then(|rm| rm.sequence_key.as_deref());

        let sequence = match sequence_key {
            Some(name) => match scalar_to_string(entity.get(name)) {
                Some(value) => Some((name, value)),
                None => {
                    tracing::debug!(
                        read_model = %binding.read_model_name,
                        sequence_key = %name,
                        "sequence value missing on entity; skipping projection"
                    );
                    return Vec::new();
                }
            },
            None => None,
        };

        ids.into_iter()
            .map(|id| match &sequence {
                Some((name, value)) => ReadModelKey::new(id).with_sequence(*name, value.clone()),
                None => ReadModelKey::new(id),
            })
            .collect()
    }

    /// Before-hooks run once per instance; the rewritten key is both the read and the write target.
    fn hooked_key(&self, binding: &ProjectionBinding, key: ReadModelKey) -> Result<ReadModelKey, ProjectionError> {
        let request = self
            .registry
            .apply_before_hooks(ReadModelRequest::by_key(&binding.read_model_name, key))?;
        request.key.ok_or_else(|| ProjectionError::Projection {
            projection_name: binding.projection_name.clone(),
            read_model_name: binding.read_model_name.clone(),
            reason: "before-hooks removed the record key".to_string(),
        })
    }

    async fn project_one(
        &self,
        binding: &ProjectionBinding,
        entity: &JsonValue,
        key: ReadModelKey,
    ) -> Result<Option<ReadModelChange>, ProjectionError> {
        let read_model_name = binding.read_model_name.as_str();
        let key = self.hooked_key(binding, key)?;

        let result = retry_if(
            &self.retry,
            "project_read_model",
            ProjectionError::is_stale_write,
            |_attempt| self.fetch_project_write(binding, entity, &key),
        )
        .await;

        match result {
            Ok(change) => Ok(change),
            Err(RetryError::Exhausted { attempts, .. }) => Err(ProjectionError::ReadModelConcurrency {
                read_model_name: read_model_name.to_string(),
                key,
                attempts,
            }),
            Err(RetryError::Aborted(err)) => Err(err),
        }
    }

    async fn fetch_project_write(
        &self,
        binding: &ProjectionBinding,
        entity: &JsonValue,
        key: &ReadModelKey,
    ) -> Result<Option<ReadModelChange>, ProjectionError> {
        let read_model_name = binding.read_model_name.as_str();
        let old = self.store.fetch_read_model(read_model_name, key).await?;

        let result = (binding.projection)(entity, old.as_ref().map(|r| &r.value)).map_err(|e| {
            ProjectionError::Projection {
                projection_name: binding.projection_name.clone(),
                read_model_name: read_model_name.to_string(),
                reason: e.to_string(),
            }
        })?;

        match result {
            ProjectionResult::Upsert(value) => {
                let expected = old.as_ref().map(|r| r.version).unwrap_or(0);
                let record = ReadModelRecord {
                    key: key.clone(),
                    version: expected + 1,
                    updated_at: Utc::now(),
                    value,
                };
                let stored = self
                    .store
                    .upsert_read_model(read_model_name, record, ExpectedVersion::Exact(expected))
                    .await?;
                Ok(Some(ReadModelChange {
                    read_model_name: read_model_name.to_string(),
                    key: stored.key,
                    kind: ChangeKind::Upserted,
                    version: stored.version,
                    value: Some(stored.value),
                }))
            }
            ProjectionResult::Delete => {
                let Some(old) = old else {
                    return Ok(None);
                };
                if !self.store.delete_read_model(read_model_name, key).await? {
                    return Ok(None);
                }
                Ok(Some(ReadModelChange {
                    read_model_name: read_model_name.to_string(),
                    key: key.clone(),
                    kind: ChangeKind::Deleted,
                    version: old.version,
                    value: None,
                }))
            }
            ProjectionResult::Nothing => Ok(None),
        }
    }

    /// External read path: before-hooks, then fetch by key or search by filters.
    pub async fn read(&self, request: ReadModelRequest) -> Result<Vec<ReadModelRecord>, ProjectionError> {
        self.read_with(request, Pagination::default()).await
    }

    #[instrument(skip(self), fields(read_model = %request.read_model_name), err)]
    pub async fn read_with(
        &self,
        request: ReadModelRequest,
        pagination: Pagination,
    ) -> Result<Vec<ReadModelRecord>, ProjectionError> {
        let binding = self.registry.read_model(&request.read_model_name).ok_or_else(|| {
            ProjectionError::RegistryLookup(format!("read model `{}` is not registered", request.read_model_name))
        })?;
        let sequenced = binding.sequence_key.is_some();

        let request = self.registry.apply_before_hooks(request)?;
        let name = request.read_model_name.as_str();

        match (&request.key, &request.filters) {
            (Some(key), _) if sequenced && key.sequence.is_none() => {
                Ok(self.store.fetch_sequence(name, &key.id).await?)
            }
            (Some(key), _) => Ok(self.store.fetch_read_model(name, key).await?.into_iter().collect()),
            (None, Some(filters)) => Ok(self.store.search_read_models(name, filters, pagination).await?),
            (None, None) => Ok(self
                .store
                .search_read_models(name, &JsonValue::Object(Default::default()), pagination)
                .await?),
        }
    }

    pub async fn delete_read_model(&self, read_model_name: &str, key: &ReadModelKey) -> Result<bool, ProjectionError> {
        Ok(self.store.delete_read_model(read_model_name, key).await?)
    }

    pub async fn clear(&self, read_model_name: &str) -> Result<usize, ProjectionError> {
        if self.registry.read_model(read_model_name).is_none() {
            return Err(ProjectionError::RegistryLookup(format!(
                "read model `{read_model_name}` is not registered"
            )));
        }
        Ok(self.store.clear(read_model_name).await?)
    }
}

fn failure(binding: &ProjectionBinding, key: ReadModelKey, error: ProjectionError) -> ProjectionFailure {
    tracing::error!(
        read_model = %binding.read_model_name,
        projection = %binding.projection_name,
        key = %key,
        error = %error,
        "read model update failed"
    );
    ProjectionFailure {
        read_model_name: binding.read_model_name.clone(),
        projection_name: binding.projection_name.clone(),
        key,
        error,
    }
}

/// Re-derive an entity's snapshot and push it through every bound projection.
///
/// `new_events` are the events that triggered the refresh (used for logging only;
/// the snapshot always reflects the whole stream).
pub async fn snapshot_and_update_read_models<P, R>(
    entity_type_name: &str,
    entity_id: &EntityId,
    new_events: &[EventEnvelope],
    event_store: &EventStore<P>,
    engine: &ProjectionEngine<R>,
) -> Result<EntityRefresh, EventStoreError>
where
    P: EventStoreProvider,
    R: ReadModelStoreProvider,
{
    let Some(snapshot) = event_store
        .fetch_entity_snapshot(entity_type_name, entity_id)
        .await?
    else {
        tracing::debug!(entity_type = %entity_type_name, entity_id = %entity_id, "entity has no state; nothing to project");
        return Ok(EntityRefresh::default());
    };

    tracing::debug!(
        entity_type = %entity_type_name,
        entity_id = %entity_id,
        new_events = new_events.len(),
        version = snapshot.version,
        "updating read models"
    );
    let outcome = engine.project_entity(&snapshot).await;
    Ok(EntityRefresh {
        snapshot: Some(snapshot),
        outcome,
    })
}

/// Values at a dotted path: a scalar gives one id, an array gives one per scalar element.
pub fn join_key_values(entity: &JsonValue, path: &str) -> Vec<EntityId> {
    let found = path
        .split('.')
        .try_fold(entity, |current, segment| current.get(segment));

    match found {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| scalar_to_string(Some(item)))
            .map(EntityId::from)
            .collect(),
        other => scalar_to_string(other).map(EntityId::from).into_iter().collect(),
    }
}

fn scalar_to_string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_keys_from_scalars_arrays_and_paths() {
        let entity = json!({
            "id": "c1",
            "cartId": 42,
            "owner": { "id": "u1" },
            "tags": ["a", "b", null, ""],
            "empty": ""
        });
        assert_eq!(join_key_values(&entity, "id"), vec![EntityId::from("c1")]);
        assert_eq!(join_key_values(&entity, "cartId"), vec![EntityId::from("42")]);
        assert_eq!(join_key_values(&entity, "owner.id"), vec![EntityId::from("u1")]);
        assert_eq!(join_key_values(&entity, "tags"), vec![EntityId::from("a"), EntityId::from("b")]);
        assert!(join_key_values(&entity, "missing").is_empty());
        assert!(join_key_values(&entity, "empty").is_empty());
        assert!(join_key_values(&entity, "owner").is_empty());
    }
}
