//! Registry of entities, reducers, read models and projections.
//!
//! The registry is built once at startup by [`RegistryBuilder`], validated
//! eagerly, and then shared read-only (`Arc<Registry>`) by every request.
//! Typed user functions are erased to JSON-in/JSON-out closures here so the
//! runtime can work on raw envelope payloads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use cairn_core::Entity;

use crate::authorization::{Access, EventStreamAuthorizer, allow_access};
use crate::event::Event;
use crate::migration;
use crate::projection::{ProjectionResult, ReadModel, ReadModelRequest};

/// `reducer(event.value, old_state) -> new_state`, on JSON.
pub type ReducerFn =
    Arc<dyn Fn(&JsonValue, Option<&JsonValue>) -> Result<JsonValue, serde_json::Error> + Send + Sync>;

/// `projection(entity, old_read_model) -> result`, on JSON.
pub type ProjectionFn = Arc<
    dyn Fn(&JsonValue, Option<&JsonValue>) -> Result<ProjectionResult<JsonValue>, serde_json::Error>
        + Send
        + Sync,
>;

/// Rewrites a read-model request before it reaches the store.
pub type BeforeHook = Arc<dyn Fn(ReadModelRequest) -> anyhow::Result<ReadModelRequest> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("entity `{0}` is registered twice")]
    DuplicateEntity(String),

    #[error("read model `{0}` is registered twice")]
    DuplicateReadModel(String),

    #[error("event type `{0}` has more than one reducer")]
    DuplicateEventType(String),

    #[error("{context} references unregistered entity `{entity}`")]
    UnknownEntity { context: String, entity: String },

    #[error("{context} references unregistered read model `{read_model}`")]
    UnknownReadModel { context: String, read_model: String },

    #[error("projection `{projection}` has an invalid join key `{join_key}`")]
    InvalidJoinKey { projection: String, join_key: String },
}

/// A before-hook failed; the read-model operation it guarded is aborted.
#[derive(Debug, Error)]
#[error("before-hook #{hook_index} of read model `{read_model_name}` failed: {source}")]
pub struct HookError {
    pub read_model_name: String,
    pub hook_index: usize,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Clone)]
pub struct EntityBinding {
    pub name: String,
    pub authorizer: EventStreamAuthorizer,
}

#[derive(Clone)]
pub struct ReducerBinding {
    pub event_type_name: String,
    pub entity_type_name: String,
    pub reducer_name: String,
    pub reducer: ReducerFn,
}

#[derive(Clone)]
pub struct ProjectionBinding {
    pub entity_type_name: String,
    pub read_model_name: String,
    /// Dotted path into the entity state (e.g. `id`, `cartId`, `owner.id`).
    pub join_key: String,
    pub projection_name: String,
    pub projection: ProjectionFn,
}

#[derive(Clone, Default)]
pub struct ReadModelBinding {
    pub name: String,
    pub before_hooks: Vec<BeforeHook>,
    pub sequence_key: Option<String>,
}

impl core::fmt::Debug for EntityBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityBinding").field("name", &self.name).finish_non_exhaustive()
    }
}

impl core::fmt::Debug for ReducerBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReducerBinding")
            .field("event_type_name", &self.event_type_name)
            .field("entity_type_name", &self.entity_type_name)
            .field("reducer_name", &self.reducer_name)
            .finish_non_exhaustive()
    }
}

impl core::fmt::Debug for ProjectionBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionBinding")
            .field("entity_type_name", &self.entity_type_name)
            .field("read_model_name", &self.read_model_name)
            .field("join_key", &self.join_key)
            .field("projection_name", &self.projection_name)
            .finish_non_exhaustive()
    }
}

impl core::fmt::Debug for ReadModelBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadModelBinding")
            .field("name", &self.name)
            .field("before_hooks", &self.before_hooks.len())
            .field("sequence_key", &self.sequence_key)
            .finish()
    }
}

/// Immutable lookup tables used by the event store, the fold and the projection engine.
#[derive(Debug, Clone)]
pub struct Registry {
    entities: BTreeMap<String, EntityBinding>,
    reducers: HashMap<String, ReducerBinding>,
    projections: HashMap<String, Vec<ProjectionBinding>>,
    read_models: BTreeMap<String, ReadModelBinding>,
    entity_migrations: BTreeSet<String>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn entity(&self, entity_type_name: &str) -> Option<&EntityBinding> {
        self.entities.get(entity_type_name)
    }

    pub fn has_entity(&self, entity_type_name: &str) -> bool {
        self.entities.contains_key(entity_type_name)
    }

    pub fn entity_type_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Reducer registered for an event type.
    pub fn reducer_for(&self, event_type_name: &str) -> Option<&ReducerBinding> {
        self.reducers.get(event_type_name)
    }

    /// Event types that overwrite whatever entity stream they land on instead of
    /// going through a reducer.
    pub fn is_entity_migration(&self, event_type_name: &str) -> bool {
        self.entity_migrations.contains(event_type_name)
    }

    /// Projection bindings whose source is the given entity type.
    pub fn projections_for(&self, entity_type_name: &str) -> &[ProjectionBinding] {
        self.projections
            .get(entity_type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn read_model(&self, read_model_name: &str) -> Option<&ReadModelBinding> {
        self.read_models.get(read_model_name)
    }

    pub fn read_model_names(&self) -> impl Iterator<Item = &str> {
        self.read_models.keys().map(String::as_str)
    }

    /// Consult the entity's event-stream authorizer. Unknown entities are denied.
    pub fn authorize_event_stream(&self, entity_type_name: &str) -> Access {
        match self.entities.get(entity_type_name) {
            Some(binding) => (binding.authorizer)(entity_type_name),
            None => Access::Deny,
        }
    }

    /// Run the read model's before-hooks as a left fold, in registration order.
    ///
    /// The first failing hook aborts the fold.
    pub fn apply_before_hooks(&self, request: ReadModelRequest) -> Result<ReadModelRequest, HookError> {
        let Some(binding) = self.read_models.get(&request.read_model_name) else {
            return Ok(request);
        };

        let read_model_name = binding.name.clone();
        binding
            .before_hooks
            .iter()
            .enumerate()
            .try_fold(request, |req, (hook_index, hook)| {
                hook(req).map_err(|source| HookError {
                    read_model_name: read_model_name.clone(),
                    hook_index,
                    source,
                })
            })
    }
}

/// Collects registrations; [`RegistryBuilder::build`] validates them all at once.
#[derive(Default)]
pub struct RegistryBuilder {
    entities: Vec<EntityBinding>,
    reducers: Vec<ReducerBinding>,
    read_models: Vec<String>,
    sequence_keys: Vec<(String, String)>,
    projections: Vec<ProjectionBinding>,
    hooks: Vec<(String, BeforeHook)>,
    entity_migrations: Vec<String>,
}

impl RegistryBuilder {
    /// New builder with the data-migration entity already registered.
    pub fn new() -> Self {
        migration::register(Self::default())
    }

    pub fn entity<E: Entity>(self) -> Self {
        self.entity_with_authorizer::<E>(allow_access)
    }

    pub fn entity_with_authorizer<E: Entity>(mut self, authorizer: EventStreamAuthorizer) -> Self {
        self.entities.push(EntityBinding {
            name: E::TYPE_NAME.to_string(),
            authorizer,
        });
        self
    }

    /// Register the reducer folding events of type `E` into `E::Entity`.
    pub fn reducer<E, F>(mut self, reducer_name: &str, reducer: F) -> Self
    where
        E: Event,
        F: Fn(&E, Option<&E::Entity>) -> E::Entity + Send + Sync + 'static,
    {
        let erased: ReducerFn = Arc::new(move |event_value, old_state| {
            let event: E = serde_json::from_value(event_value.clone())?;
            let old: Option<E::Entity> = old_state.cloned().map(serde_json::from_value).transpose()?;
            serde_json::to_value(reducer(&event, old.as_ref()))
        });

        self.reducers.push(ReducerBinding {
            event_type_name: E::TYPE_NAME.to_string(),
            entity_type_name: <E::Entity as Entity>::TYPE_NAME.to_string(),
            reducer_name: reducer_name.to_string(),
            reducer: erased,
        });
        self
    }

    pub(crate) fn entity_migration(mut self, event_type_name: &str) -> Self {
        self.entity_migrations.push(event_type_name.to_string());
        self
    }

    pub fn read_model<R: ReadModel>(mut self) -> Self {
        self.read_models.push(R::TYPE_NAME.to_string());
        self
    }

    /// Key records of `R` by `(id, <sequence_key>)` instead of `id` alone.
    pub fn sequenced_by<R: ReadModel>(mut self, sequence_key: &str) -> Self {
        self.sequence_keys
            .push((R::TYPE_NAME.to_string(), sequence_key.to_string()));
        self
    }

    /// Project entity `S` onto read model `R`, joining on `join_key` of the entity state.
    pub fn projection<S, R, F>(mut self, join_key: &str, projection_name: &str, projection: F) -> Self
    where
        S: Entity,
        R: ReadModel,
        F: Fn(&S, Option<&R>) -> ProjectionResult<R> + Send + Sync + 'static,
    {
        let erased: ProjectionFn = Arc::new(move |entity_value, old_value| {
            let entity: S = serde_json::from_value(entity_value.clone())?;
            let old: Option<R> = old_value.cloned().map(serde_json::from_value).transpose()?;
            projection(&entity, old.as_ref()).try_map(|rm| serde_json::to_value(rm))
        });

        self.projections.push(ProjectionBinding {
            entity_type_name: S::TYPE_NAME.to_string(),
            read_model_name: R::TYPE_NAME.to_string(),
            join_key: join_key.to_string(),
            projection_name: projection_name.to_string(),
            projection: erased,
        });
        self
    }

    pub fn before_hook<R, F>(mut self, hook: F) -> Self
    where
        R: ReadModel,
        F: Fn(ReadModelRequest) -> anyhow::Result<ReadModelRequest> + Send + Sync + 'static,
    {
        self.hooks.push((R::TYPE_NAME.to_string(), Arc::new(hook)));
        self
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut entities = BTreeMap::new();
        for binding in self.entities {
            if entities.contains_key(&binding.name) {
                return Err(RegistryError::DuplicateEntity(binding.name));
            }
            entities.insert(binding.name.clone(), binding);
        }

        let mut read_models: BTreeMap<String, ReadModelBinding> = BTreeMap::new();
        for name in self.read_models {
            if read_models.contains_key(&name) {
                return Err(RegistryError::DuplicateReadModel(name));
            }
            read_models.insert(
                name.clone(),
                ReadModelBinding {
                    name,
                    ..ReadModelBinding::default()
                },
            );
        }

        let mut reducers = HashMap::new();
        for binding in self.reducers {
            if !entities.contains_key(&binding.entity_type_name) {
                return Err(RegistryError::UnknownEntity {
                    context: format!("reducer `{}`", binding.reducer_name),
                    entity: binding.entity_type_name,
                });
            }
            if reducers.contains_key(&binding.event_type_name) {
                return Err(RegistryError::DuplicateEventType(binding.event_type_name));
            }
            reducers.insert(binding.event_type_name.clone(), binding);
        }

        let mut entity_migrations = BTreeSet::new();
        for event_type_name in self.entity_migrations {
            if reducers.contains_key(&event_type_name) || !entity_migrations.insert(event_type_name.clone()) {
                return Err(RegistryError::DuplicateEventType(event_type_name));
            }
        }

        for (read_model, key) in self.sequence_keys {
            let binding = read_models.get_mut(&read_model).ok_or_else(|| RegistryError::UnknownReadModel {
                context: format!("sequence key `{key}`"),
                read_model: read_model.clone(),
            })?;
            binding.sequence_key = Some(key);
        }

        for (read_model, hook) in self.hooks {
            let binding = read_models.get_mut(&read_model).ok_or_else(|| RegistryError::UnknownReadModel {
                context: "before-hook".to_string(),
                read_model: read_model.clone(),
            })?;
            binding.before_hooks.push(hook);
        }

        let mut projections: HashMap<String, Vec<ProjectionBinding>> = HashMap::new();
        for binding in self.projections {
            let context = format!("projection `{}`", binding.projection_name);
            if !entities.contains_key(&binding.entity_type_name) {
                return Err(RegistryError::UnknownEntity {
                    context,
                    entity: binding.entity_type_name,
                });
            }
            if !read_models.contains_key(&binding.read_model_name) {
                return Err(RegistryError::UnknownReadModel {
                    context,
                    read_model: binding.read_model_name,
                });
            }
            if binding.join_key.is_empty() || binding.join_key.split('.').any(str::is_empty) {
                return Err(RegistryError::InvalidJoinKey {
                    projection: binding.projection_name,
                    join_key: binding.join_key,
                });
            }
            projections
                .entry(binding.entity_type_name.clone())
                .or_default()
                .push(binding);
        }

        Ok(Registry {
            entities,
            reducers,
            projections,
            read_models,
            entity_migrations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{DataMigrationEntity, DataMigrationStarted, EntityMigrated};
    use cairn_core::EntityId;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counter {
        id: EntityId,
        total: i64,
    }

    impl Entity for Counter {
        const TYPE_NAME: &'static str = "Counter";
        fn id(&self) -> &EntityId {
            &self.id
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Added {
        id: EntityId,
        amount: i64,
    }

    impl Event for Added {
        const TYPE_NAME: &'static str = "Added";
        type Entity = Counter;
        fn entity_id(&self) -> EntityId {
            self.id.clone()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CounterView {
        id: EntityId,
        doubled: i64,
    }

    impl ReadModel for CounterView {
        const TYPE_NAME: &'static str = "CounterView";
    }

    fn add(event: &Added, old: Option<&Counter>) -> Counter {
        Counter {
            id: event.id.clone(),
            total: old.map(|c| c.total).unwrap_or(0) + event.amount,
        }
    }

    fn view(counter: &Counter, _old: Option<&CounterView>) -> ProjectionResult<CounterView> {
        ProjectionResult::Upsert(CounterView {
            id: counter.id.clone(),
            doubled: counter.total * 2,
        })
    }

    fn full_builder() -> RegistryBuilder {
        Registry::builder()
            .entity::<Counter>()
            .reducer::<Added, _>("add", add)
            .read_model::<CounterView>()
            .projection::<Counter, CounterView, _>("id", "view", view)
    }

    #[test]
    fn erased_reducer_and_projection_work_on_json() {
        let registry = full_builder().build().unwrap();

        let reducer = registry.reducer_for("Added").unwrap();
        assert_eq!(reducer.entity_type_name, "Counter");
        let state = (reducer.reducer)(&json!({"id": "c1", "amount": 3}), Some(&json!({"id": "c1", "total": 4}))).unwrap();
        assert_eq!(state, json!({"id": "c1", "total": 7}));

        let bindings = registry.projections_for("Counter");
        assert_eq!(bindings.len(), 1);
        let result = (bindings[0].projection)(&state, None).unwrap();
        assert_eq!(result, ProjectionResult::Upsert(json!({"id": "c1", "doubled": 14})));
        assert!(registry.projections_for("Nope").is_empty());
    }

    #[test]
    fn reducer_payload_errors_surface_as_json_errors() {
        let registry = full_builder().build().unwrap();
        let reducer = registry.reducer_for("Added").unwrap();
        assert!((reducer.reducer)(&json!({"id": "c1"}), None).is_err());
    }

    #[test]
    fn build_rejects_dangling_references() {
        let err = Registry::builder().reducer::<Added, _>("add", add).build().unwrap_err();
        assert!(matches!(err, RegistryError::UnknownEntity { entity, .. } if entity == "Counter"));

        let err = Registry::builder()
            .entity::<Counter>()
            .projection::<Counter, CounterView, _>("id", "view", view)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownReadModel { read_model, .. } if read_model == "CounterView"));

        let err = Registry::builder()
            .before_hook::<CounterView, _>(Ok)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownReadModel { .. }));

        let err = Registry::builder().sequenced_by::<CounterView>("ts").build().unwrap_err();
        assert!(matches!(err, RegistryError::UnknownReadModel { .. }));
    }

    #[test]
    fn build_rejects_duplicates_and_bad_join_keys() {
        let err = full_builder().reducer::<Added, _>("add_again", add).build().unwrap_err();
        assert_eq!(err, RegistryError::DuplicateEventType("Added".into()));

        let err = full_builder().entity::<Counter>().build().unwrap_err();
        assert_eq!(err, RegistryError::DuplicateEntity("Counter".into()));

        let err = full_builder()
            .projection::<Counter, CounterView, _>("owner..id", "bad", view)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidJoinKey { .. }));
    }

    #[test]
    fn hooks_fold_left_in_registration_order() {
        let registry = full_builder()
            .before_hook::<CounterView, _>(|mut req| {
                req.filters = Some(json!(["first"]));
                Ok(req)
            })
            .before_hook::<CounterView, _>(|mut req| {
                if let Some(JsonValue::Array(items)) = req.filters.as_mut() {
                    items.push(json!("second"));
                }
                Ok(req)
            })
            .build()
            .unwrap();

        let out = registry
            .apply_before_hooks(ReadModelRequest::by_filters("CounterView", json!(null)))
            .unwrap();
        assert_eq!(out.filters, Some(json!(["first", "second"])));
    }

    #[test]
    fn failing_hook_reports_its_index() {
        let registry = full_builder()
            .before_hook::<CounterView, _>(Ok)
            .before_hook::<CounterView, _>(|_| Err(anyhow::anyhow!("nope")))
            .build()
            .unwrap();

        let err = registry
            .apply_before_hooks(ReadModelRequest::by_filters("CounterView", json!({})))
            .unwrap_err();
        assert_eq!(err.hook_index, 1);
        assert_eq!(err.read_model_name, "CounterView");
    }

    #[test]
    fn data_migration_entity_is_registered_and_denied() {
        let registry = Registry::builder().build().unwrap();
        assert!(registry.has_entity(DataMigrationEntity::TYPE_NAME));
        assert!(registry.reducer_for(DataMigrationStarted::TYPE_NAME).is_some());
        assert!(registry.is_entity_migration(EntityMigrated::TYPE_NAME));
        assert!(registry.reducer_for(EntityMigrated::TYPE_NAME).is_none());
        assert_eq!(
            registry.authorize_event_stream(DataMigrationEntity::TYPE_NAME),
            Access::Deny
        );
        assert_eq!(registry.authorize_event_stream("Unknown"), Access::Deny);

        let registry = full_builder().build().unwrap();
        assert_eq!(registry.authorize_event_stream("Counter"), Access::Allow);
    }
}
