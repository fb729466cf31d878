//! Data-migration lifecycle coordination.
//!
//! Migrations are tracked as a regular event-sourced entity
//! ([`DataMigrationEntity`]): starting and finishing emit events through the
//! dispatcher, and the status is the folded entity. Lifecycle events are
//! appended against the head the status was read at, so two concurrent
//! `start`s cannot both succeed.
//!
//! While a migration runs, [`DataMigrationCoordinator::migrate_entity`] writes
//! an entity's state in its new shape as an [`EntityMigrated`] event.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use cairn_core::{Entity, EntityId, ExpectedVersion, RequestId};
use cairn_events::{
    CodecError, DataMigrationEntity, DataMigrationFinished, DataMigrationStarted, DataMigrationStatus, EntityMigrated,
    EventBus, EventEnvelope, ReadModelChange, decode_value,
};

use crate::dispatcher::{DispatchError, DispatchFailure, DispatchReport, DispatchStage, EventDispatcher};
use crate::event_store::{EventStore, EventStoreError, EventStoreProvider};
use crate::read_model::ReadModelStoreProvider;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("data migration `{0}` is already running")]
    AlreadyRunning(EntityId),

    #[error("data migration `{0}` has not been started")]
    NotStarted(EntityId),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error("data migration event was not stored: {}", .0.error)]
    Dispatch(DispatchFailure),
}

pub struct DataMigrationCoordinator<P, R, B> {
    event_store: Arc<EventStore<P>>,
    dispatcher: Arc<EventDispatcher<P, R, B>>,
}

impl<P, R, B> DataMigrationCoordinator<P, R, B>
where
    P: EventStoreProvider,
    R: ReadModelStoreProvider,
    B: EventBus<ReadModelChange>,
{
    pub fn new(event_store: Arc<EventStore<P>>, dispatcher: Arc<EventDispatcher<P, R, B>>) -> Self {
        Self {
            event_store,
            dispatcher,
        }
    }

    /// Current state of a migration, `None` if it was never started.
    pub async fn status(&self, name: &EntityId) -> Result<Option<DataMigrationEntity>, MigrationError> {
        Ok(self.status_at(name).await?.0)
    }

    /// Mark a migration as started. Restarting a finished migration is allowed.
    pub async fn start(&self, name: &EntityId) -> Result<DataMigrationEntity, MigrationError> {
        let (current, head) = self.status_at(name).await?;
        if current.is_some_and(|m| m.status == DataMigrationStatus::Started) {
            return Err(MigrationError::AlreadyRunning(name.clone()));
        }

        let event = DataMigrationStarted {
            name: name.clone(),
            started_at: Utc::now(),
        };
        self.emit_at(EventEnvelope::event(&event, RequestId::new())?, head)
            .await
            .map_err(|err| lost_race(err, || MigrationError::AlreadyRunning(name.clone())))?;
        tracing::info!(migration = %name, "data migration started");
        self.required_status(name).await
    }

    pub async fn finish(&self, name: &EntityId) -> Result<DataMigrationEntity, MigrationError> {
        let (current, head) = self.status_at(name).await?;
        if !current.is_some_and(|m| m.status == DataMigrationStatus::Started) {
            return Err(MigrationError::NotStarted(name.clone()));
        }

        let event = DataMigrationFinished {
            name: name.clone(),
            finished_at: Utc::now(),
        };
        self.emit_at(EventEnvelope::event(&event, RequestId::new())?, head)
            .await
            .map_err(|err| lost_race(err, || MigrationError::NotStarted(name.clone())))?;
        tracing::info!(migration = %name, "data migration finished");
        self.required_status(name).await
    }

    /// Replace an entity's state with `migrated` as part of the running migration
    /// `name`. Snapshots and read models are recomputed like for any other event.
    pub async fn migrate_entity<E: Entity>(&self, name: &EntityId, migrated: &E) -> Result<E, MigrationError> {
        if !self
            .status(name)
            .await?
            .is_some_and(|m| m.status == DataMigrationStatus::Started)
        {
            return Err(MigrationError::NotStarted(name.clone()));
        }

        let envelope = EntityMigrated::new(migrated)?.into_envelope(RequestId::new())?;
        let report = self.emit(envelope).await?;
        tracing::info!(
            migration = %name,
            entity_type = E::TYPE_NAME,
            entity_id = %migrated.id(),
            read_model_changes = report.changes.len(),
            "entity migrated"
        );
        self.event_store
            .fetch_entity::<E>(migrated.id())
            .await?
            .ok_or_else(|| {
                MigrationError::EventStore(EventStoreError::EntityNotFound {
                    entity_type_name: E::TYPE_NAME.to_string(),
                    entity_id: migrated.id().clone(),
                })
            })
    }

    /// Folded status plus the stream head it was folded at.
    async fn status_at(&self, name: &EntityId) -> Result<(Option<DataMigrationEntity>, u64), MigrationError> {
        let Some(snapshot) = self
            .event_store
            .fetch_entity_snapshot(DataMigrationEntity::TYPE_NAME, name)
            .await?
        else {
            return Ok((None, 0));
        };
        Ok((Some(decode_value(&snapshot)?), snapshot.version))
    }

    async fn emit_at(&self, envelope: EventEnvelope, head: u64) -> Result<DispatchReport, MigrationError> {
        let report = self
            .dispatcher
            .dispatch_expecting(vec![envelope], ExpectedVersion::Exact(head))
            .await;
        first_failure(report)
    }

    async fn emit(&self, envelope: EventEnvelope) -> Result<DispatchReport, MigrationError> {
        first_failure(self.dispatcher.dispatch_envelopes(vec![envelope]).await)
    }

    async fn required_status(&self, name: &EntityId) -> Result<DataMigrationEntity, MigrationError> {
        self.status(name)
            .await?
            .ok_or_else(|| MigrationError::NotStarted(name.clone()))
    }
}

fn first_failure(mut report: DispatchReport) -> Result<DispatchReport, MigrationError> {
    if report.failures.is_empty() {
        return Ok(report);
    }
    Err(MigrationError::Dispatch(report.failures.swap_remove(0)))
}

/// Another writer appended to the migration stream between our read and our append.
fn lost_race(err: MigrationError, status_error: impl FnOnce() -> MigrationError) -> MigrationError {
    match err {
        MigrationError::Dispatch(DispatchFailure {
            stage: DispatchStage::Persist,
            error: DispatchError::Store(EventStoreError::Concurrency(_)),
            ..
        }) => status_error(),
        other => other,
    }
}
