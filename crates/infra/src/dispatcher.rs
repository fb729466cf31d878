//! Event dispatch pipeline.
//!
//! ```text
//! raw batch
//!   ↓ decode                  (whole batch rejected on failure)
//!   ↓ registry check          (unknown event types recorded and skipped)
//!   ↓ per stream, concurrently:
//!       persist → recompute snapshot → project read models
//!   ↓ notify subscribers      (best-effort; never rolls anything back)
//! ```
//!
//! A failure in one stream never aborts another; everything that went wrong is
//! collected in the [`DispatchReport`].

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::instrument;

use cairn_core::ExpectedVersion;
use cairn_events::{
    CodecError, EntityMigrated, EventBus, EventEnvelope, ReadModelChange, Registry, StreamKey, decode_raw,
};

use crate::event_store::store::group_by_stream;
use crate::event_store::{EventStore, EventStoreError, EventStoreProvider};
use crate::projections::{ProjectionEngine, ProjectionError, snapshot_and_update_read_models};
use crate::read_model::ReadModelStoreProvider;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to decode event batch: {0}")]
    Decode(#[from] CodecError),

    #[error("registry lookup failed: {0}")]
    RegistryLookup(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

/// Pipeline stage at which a stream failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    Validate,
    Persist,
    Recompute,
    Project,
}

#[derive(Debug)]
pub struct DispatchFailure {
    pub stream: StreamKey,
    pub stage: DispatchStage,
    pub error: DispatchError,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Events as stored (with versions assigned).
    pub stored: Vec<EventEnvelope>,
    pub changes: Vec<ReadModelChange>,
    pub failures: Vec<DispatchFailure>,
    /// Change notifications that could not be published.
    pub notification_failures: Vec<String>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.notification_failures.is_empty()
    }

    pub fn failures_for<'a>(&'a self, stream: &'a StreamKey) -> impl Iterator<Item = &'a DispatchFailure> + 'a {
        self.failures.iter().filter(move |f| &f.stream == stream)
    }
}

#[derive(Default)]
struct StreamReport {
    stored: Vec<EventEnvelope>,
    changes: Vec<ReadModelChange>,
    failures: Vec<DispatchFailure>,
}

pub struct EventDispatcher<P, R, B> {
    registry: Arc<Registry>,
    event_store: Arc<EventStore<P>>,
    engine: Arc<ProjectionEngine<R>>,
    bus: B,
}

impl<P, R, B> EventDispatcher<P, R, B>
where
    P: EventStoreProvider,
    R: ReadModelStoreProvider,
    B: EventBus<ReadModelChange>,
{
    pub fn new(
        registry: Arc<Registry>,
        event_store: Arc<EventStore<P>>,
        engine: Arc<ProjectionEngine<R>>,
        bus: B,
    ) -> Self {
        Self {
            registry,
            event_store,
            engine,
            bus,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Dispatch a raw batch (one envelope object or an array of them).
    pub async fn dispatch(&self, raw: &JsonValue) -> Result<DispatchReport, DispatchError> {
        let envelopes = decode_raw(raw)?;
        Ok(self.dispatch_envelopes(envelopes).await)
    }

    pub async fn dispatch_envelopes(&self, envelopes: Vec<EventEnvelope>) -> DispatchReport {
        self.run(envelopes, None).await
    }

    /// Like [`Self::dispatch_envelopes`], but every stream in the batch is appended
    /// only if its head is still at `expected`. Conflicts are reported, not retried.
    pub async fn dispatch_expecting(&self, envelopes: Vec<EventEnvelope>, expected: ExpectedVersion) -> DispatchReport {
        self.run(envelopes, Some(expected)).await
    }

    #[instrument(skip(self, envelopes), fields(batch_size = envelopes.len(), guarded = expected.is_some()))]
    async fn run(&self, envelopes: Vec<EventEnvelope>, expected: Option<ExpectedVersion>) -> DispatchReport {
        let mut report = DispatchReport::default();

        let mut accepted = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            match self.validate(&envelope) {
                Ok(()) => accepted.push(envelope),
                Err(error) => {
                    tracing::warn!(stream = %envelope.stream_key(), event_type = %envelope.type_name, error = %error, "skipping event");
                    report.failures.push(DispatchFailure {
                        stream: envelope.stream_key(),
                        stage: DispatchStage::Validate,
                        error,
                    });
                }
            }
        }

        let streams = group_by_stream(accepted);
        let results = join_all(
            streams
                .into_iter()
                .map(|(stream, batch)| self.process_stream(stream, batch, expected)),
        )
        .await;

        for stream_report in results {
            report.stored.extend(stream_report.stored);
            report.changes.extend(stream_report.changes);
            report.failures.extend(stream_report.failures);
        }

        for change in &report.changes {
            if let Err(err) = self.bus.publish(change.clone()) {
                tracing::warn!(read_model = %change.read_model_name, key = %change.key, error = %err, "change notification failed");
                report
                    .notification_failures
                    .push(format!("{}/{}: {err}", change.read_model_name, change.key));
            }
        }

        tracing::info!(
            stored = report.stored.len(),
            changes = report.changes.len(),
            failures = report.failures.len(),
            "batch dispatched"
        );
        report
    }

    fn validate(&self, envelope: &EventEnvelope) -> Result<(), DispatchError> {
        if !envelope.is_event() {
            return Err(DispatchError::RegistryLookup(format!(
                "`{}` is a snapshot; only events can be dispatched",
                envelope.type_name
            )));
        }
        if self.registry.is_entity_migration(&envelope.type_name) {
            return self.validate_entity_migration(envelope);
        }
        let binding = self.registry.reducer_for(&envelope.type_name).ok_or_else(|| {
            DispatchError::RegistryLookup(format!("no reducer registered for event type `{}`", envelope.type_name))
        })?;
        if binding.entity_type_name != envelope.entity_type_name {
            return Err(DispatchError::RegistryLookup(format!(
                "event type `{}` belongs to `{}`, not `{}`",
                envelope.type_name, binding.entity_type_name, envelope.entity_type_name
            )));
        }
        Ok(())
    }

    fn validate_entity_migration(&self, envelope: &EventEnvelope) -> Result<(), DispatchError> {
        let migrated: EntityMigrated =
            serde_json::from_value(envelope.value.clone()).map_err(|source| CodecError::Payload {
                type_name: envelope.type_name.clone(),
                source,
            })?;
        let target = migrated.stream_key();
        if target != envelope.stream_key() {
            return Err(DispatchError::RegistryLookup(format!(
                "`{}` rewrites {target} but was sent to {}",
                envelope.type_name,
                envelope.stream_key()
            )));
        }
        if !self.registry.has_entity(&target.entity_type_name) {
            return Err(DispatchError::RegistryLookup(format!(
                "`{}` targets unregistered entity `{}`",
                envelope.type_name, target.entity_type_name
            )));
        }
        Ok(())
    }

    async fn process_stream(
        &self,
        stream: StreamKey,
        batch: Vec<EventEnvelope>,
        expected: Option<ExpectedVersion>,
    ) -> StreamReport {
        let mut report = StreamReport::default();

        let appended = match expected {
            Some(expected) => self.event_store.append_expecting(&stream, batch, expected).await,
            None => self.event_store.store_stream_events(&stream, batch).await,
        };
        let stored = match appended {
            Ok(stored) => stored,
            Err(err) => {
                report.failures.push(DispatchFailure {
                    stream,
                    stage: DispatchStage::Persist,
                    error: err.into(),
                });
                return report;
            }
        };

        let refresh = snapshot_and_update_read_models(
            &stream.entity_type_name,
            &stream.entity_id,
            &stored,
            &self.event_store,
            &self.engine,
        )
        .await;
        report.stored = stored;

        match refresh {
            Ok(refresh) => {
                report.changes = refresh.outcome.changes;
                report
                    .failures
                    .extend(refresh.outcome.failures.into_iter().map(|failure| DispatchFailure {
                        stream: stream.clone(),
                        stage: DispatchStage::Project,
                        error: failure.error.into(),
                    }));
            }
            Err(err) => report.failures.push(DispatchFailure {
                stream,
                stage: DispatchStage::Recompute,
                error: err.into(),
            }),
        }

        report
    }
}
