//! Runtime facade: one value wiring the event store, projection engine,
//! dispatcher and notification bus around a shared registry.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::instrument;

use cairn_core::{Entity, EntityId};
use cairn_events::{
    EventBus, ReadModel, ReadModelChange, ReadModelKey, ReadModelRequest, Registry, Subscription,
};

use crate::config::{ConfigError, RuntimeConfig};
use crate::dispatcher::{DispatchError, DispatchReport, EventDispatcher};
use crate::event_store::{EventSearchQuery, EventSearchResult, EventStore, EventStoreError, EventStoreProvider, Pagination};
use crate::migration::DataMigrationCoordinator;
use crate::projections::{
    EntityRefresh, ProjectionEngine, ProjectionError, ReplayHandle, replay_entities, replay_entity,
};
use crate::read_model::ReadModelStoreProvider;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("failed to decode read model `{read_model_name}`: {source}")]
    ReadModelDecode {
        read_model_name: String,
        #[source]
        source: serde_json::Error,
    },
}

pub struct Runtime<P, R, B> {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    event_store: Arc<EventStore<P>>,
    engine: Arc<ProjectionEngine<R>>,
    dispatcher: Arc<EventDispatcher<P, R, B>>,
    migrations: DataMigrationCoordinator<P, R, B>,
}

impl<P, R, B> Runtime<P, R, B>
where
    P: EventStoreProvider + 'static,
    R: ReadModelStoreProvider + 'static,
    B: EventBus<ReadModelChange>,
{
    pub fn new(
        config: RuntimeConfig,
        registry: Arc<Registry>,
        provider: P,
        read_models: R,
        bus: B,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let event_store = Arc::new(EventStore::new(provider, registry.clone(), config.event_store.clone()));
        let engine = Arc::new(ProjectionEngine::new(
            read_models,
            registry.clone(),
            config.projections.retry.clone(),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            registry.clone(),
            event_store.clone(),
            engine.clone(),
            bus,
        ));
        let migrations = DataMigrationCoordinator::new(event_store.clone(), dispatcher.clone());

        tracing::info!(
            app = %config.app_name,
            entities = registry.entity_type_names().count(),
            read_models = registry.read_model_names().count(),
            "runtime ready"
        );

        Ok(Self {
            config,
            registry,
            event_store,
            engine,
            dispatcher,
            migrations,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn event_store(&self) -> &Arc<EventStore<P>> {
        &self.event_store
    }

    pub fn engine(&self) -> &Arc<ProjectionEngine<R>> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher<P, R, B>> {
        &self.dispatcher
    }

    /// Dispatch a raw JSON batch (one envelope or an array).
    pub async fn dispatch_event(&self, raw: &JsonValue) -> Result<DispatchReport, RuntimeError> {
        Ok(self.dispatcher.dispatch(raw).await?)
    }

    pub async fn entity<E: Entity>(&self, entity_id: &EntityId) -> Result<Option<E>, RuntimeError> {
        Ok(self.event_store.fetch_entity::<E>(entity_id).await?)
    }

    /// Drop an entity's snapshots. Events and read models are untouched; the next
    /// fetch folds from scratch. Read models may combine several entities, so they
    /// only change through projections.
    #[instrument(skip(self), err)]
    pub async fn delete_entity(&self, entity_type_name: &str, entity_id: &EntityId) -> Result<usize, RuntimeError> {
        Ok(self
            .event_store
            .delete_entity_snapshots(entity_type_name, entity_id)
            .await?)
    }

    pub async fn replay(&self, entity_type_name: &str, entity_id: &EntityId) -> Result<EntityRefresh, RuntimeError> {
        let refresh = replay_entity(&self.event_store, &self.engine, entity_type_name, entity_id).await?;
        self.notify(&refresh.outcome.changes);
        Ok(refresh)
    }

    /// Replay every entity of a type in the background.
    pub fn replay_all(&self, entity_type_name: impl Into<String>) -> ReplayHandle {
        replay_entities(self.event_store.clone(), self.engine.clone(), entity_type_name.into())
    }

    /// Audit search over raw events; subject to the entity's stream authorizer.
    pub async fn events(&self, query: &EventSearchQuery) -> Result<EventSearchResult, RuntimeError> {
        Ok(self.event_store.search_events(query).await?)
    }

    /// Typed read: hooks, then fetch/search, then decode each record value.
    pub async fn read_model<M: ReadModel>(&self, request: ReadModelRequest) -> Result<Vec<M>, RuntimeError> {
        self.read_model_page(request, Pagination::default()).await
    }

    pub async fn read_model_page<M: ReadModel>(
        &self,
        request: ReadModelRequest,
        pagination: Pagination,
    ) -> Result<Vec<M>, RuntimeError> {
        let records = self.engine.read_with(request, pagination).await?;
        records
            .into_iter()
            .map(|record| {
                serde_json::from_value(record.value).map_err(|source| RuntimeError::ReadModelDecode {
                    read_model_name: M::TYPE_NAME.to_string(),
                    source,
                })
            })
            .collect()
    }

    pub async fn delete_read_model(&self, read_model_name: &str, key: &ReadModelKey) -> Result<bool, RuntimeError> {
        Ok(self.engine.delete_read_model(read_model_name, key).await?)
    }

    pub fn subscribe(&self) -> Subscription<ReadModelChange> {
        self.dispatcher.bus().subscribe()
    }

    pub fn migrations(&self) -> &DataMigrationCoordinator<P, R, B> {
        &self.migrations
    }

    fn notify(&self, changes: &[ReadModelChange]) {
        for change in changes {
            if let Err(err) = self.dispatcher.bus().publish(change.clone()) {
                tracing::warn!(read_model = %change.read_model_name, key = %change.key, error = %err, "change notification failed");
            }
        }
    }
}
