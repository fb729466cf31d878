//! Replay tooling: rebuild snapshots and read models from event streams.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use cairn_core::EntityId;

use super::engine::{EntityRefresh, ProjectionEngine, snapshot_and_update_read_models};
use crate::event_store::{EventStore, EventStoreError, EventStoreProvider};
use crate::read_model::ReadModelStoreProvider;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("listing entities failed: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("replay aborted: {0}")]
    Failed(String),

    #[error("replay cancelled")]
    Cancelled,

    /// The background task went away without reporting a final phase.
    #[error("replay task ended unexpectedly")]
    Abandoned,
}

/// Snapshot of a running (or finished) type-wide replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayProgress {
    pub entity_type_name: String,
    pub total_entities: u64,
    pub processed_entities: u64,
    pub read_model_changes: u64,
    /// Entities whose refresh (or some of whose read models) failed.
    pub failed_entities: Vec<EntityId>,
    pub phase: ReplayPhase,
}

impl ReplayProgress {
    fn starting(entity_type_name: String) -> Self {
        Self {
            entity_type_name,
            total_entities: 0,
            processed_entities: 0,
            read_model_changes: 0,
            failed_entities: Vec::new(),
            phase: ReplayPhase::Loading,
        }
    }

    fn record(&mut self, id: EntityId, result: Result<EntityRefresh, EventStoreError>) {
        self.processed_entities += 1;
        match result {
            Ok(refresh) => {
                self.read_model_changes += refresh.outcome.changes.len() as u64;
                if !refresh.outcome.is_clean() {
                    self.failed_entities.push(id);
                }
            }
            Err(err) => {
                tracing::error!(
                    entity_type = %self.entity_type_name,
                    entity_id = %id,
                    error = %err,
                    "entity replay failed"
                );
                self.failed_entities.push(id);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    /// Listing entity ids.
    Loading,
    Replaying,
    Complete,
    Cancelled,
    Failed { error: String },
}

impl ReplayPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed { .. })
    }
}

/// Watches and controls a background replay. Cloning shares the same task.
#[derive(Clone)]
pub struct ReplayHandle {
    progress: watch::Receiver<ReplayProgress>,
    cancel_requested: Arc<AtomicBool>,
}

impl ReplayHandle {
    pub fn progress(&self) -> ReplayProgress {
        self.progress.borrow().clone()
    }

    /// Stops the replay before the next entity.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Relaxed)
    }

    pub async fn wait_for_completion(&self) -> Result<ReplayProgress, ReplayError> {
        let mut rx = self.progress.clone();
        let finished = rx
            .wait_for(|p| p.phase.is_finished())
            .await
            .map_err(|_| ReplayError::Abandoned)?
            .clone();
        match &finished.phase {
            ReplayPhase::Complete => Ok(finished),
            ReplayPhase::Failed { error } => Err(ReplayError::Failed(error.clone())),
            _ => Err(ReplayError::Cancelled),
        }
    }
}

/// Rebuild one entity: drop its snapshots, re-read the full stream and refresh
/// every read model it projects onto.
pub async fn replay_entity<P, R>(
    event_store: &EventStore<P>,
    engine: &ProjectionEngine<R>,
    entity_type_name: &str,
    entity_id: &EntityId,
) -> Result<EntityRefresh, EventStoreError>
where
    P: EventStoreProvider,
    R: ReadModelStoreProvider,
{
    let removed = event_store.delete_entity_snapshots(entity_type_name, entity_id).await?;
    let events = event_store
        .for_entity_since(entity_type_name, entity_id, None)
        .collect()
        .await?;
    tracing::info!(
        entity_type = %entity_type_name,
        entity_id = %entity_id,
        snapshots_removed = removed,
        events = events.len(),
        "replaying entity"
    );
    snapshot_and_update_read_models(entity_type_name, entity_id, &events, event_store, engine).await
}

/// Replay every entity of a type in a background task.
pub fn replay_entities<P, R>(
    event_store: Arc<EventStore<P>>,
    engine: Arc<ProjectionEngine<R>>,
    entity_type_name: String,
) -> ReplayHandle
where
    P: EventStoreProvider + 'static,
    R: ReadModelStoreProvider + 'static,
{
    let (tx, rx) = watch::channel(ReplayProgress::starting(entity_type_name.clone()));
    let cancel_requested = Arc::new(AtomicBool::new(false));
    let handle = ReplayHandle {
        progress: rx,
        cancel_requested: cancel_requested.clone(),
    };

    tokio::spawn(async move {
        let phase = match run_replay(&event_store, &engine, &entity_type_name, &tx, &cancel_requested).await {
            Ok(()) => ReplayPhase::Complete,
            Err(ReplayError::Cancelled) => ReplayPhase::Cancelled,
            Err(e) => {
                tracing::warn!(entity_type = %entity_type_name, error = %e, "replay stopped");
                ReplayPhase::Failed { error: e.to_string() }
            }
        };
        tx.send_modify(|p| p.phase = phase);
    });

    handle
}

async fn run_replay<P, R>(
    event_store: &EventStore<P>,
    engine: &ProjectionEngine<R>,
    entity_type_name: &str,
    progress: &watch::Sender<ReplayProgress>,
    cancel_requested: &AtomicBool,
) -> Result<(), ReplayError>
where
    P: EventStoreProvider,
    R: ReadModelStoreProvider,
{
    let ids = event_store.entity_ids(entity_type_name).await?;
    progress.send_modify(|p| {
        p.total_entities = ids.len() as u64;
        p.phase = ReplayPhase::Replaying;
    });

    for id in ids {
        if cancel_requested.load(Ordering::Relaxed) {
            return Err(ReplayError::Cancelled);
        }
        let result = replay_entity(event_store, engine, entity_type_name, &id).await;
        progress.send_modify(|p| p.record(id, result));
    }

    Ok(())
}
