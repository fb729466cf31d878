use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use cairn_core::{EntityId, ExpectedVersion};
use cairn_events::{EventEnvelope, FoldError, StreamKey};

use super::query::{EventSearchQuery, EventSearchResult};

/// Event store operation error.
///
/// Only `Concurrency` is ever retried (by [`EventStore`](super::EventStore));
/// everything else propagates to the caller unchanged.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The stream head moved, or a read found non-contiguous versions.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("entity {entity_type_name}/{entity_id} not found")]
    EntityNotFound {
        entity_type_name: String,
        entity_id: EntityId,
    },

    #[error("registry lookup failed: {0}")]
    RegistryLookup(String),

    #[error("reducer failed: {0}")]
    Reducer(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Provider-level failure (IO, lock poisoning, ...).
    #[error("event store backend error: {0}")]
    Backend(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }
}

impl From<FoldError> for EventStoreError {
    fn from(err: FoldError) -> Self {
        match err {
            FoldError::VersionGap { .. } => EventStoreError::Concurrency(err.to_string()),
            FoldError::RegistryLookup { .. } => EventStoreError::RegistryLookup(err.to_string()),
            FoldError::Reducer { .. } => EventStoreError::Reducer(err.to_string()),
            FoldError::EntityMismatch { .. } => EventStoreError::InvalidAppend(err.to_string()),
        }
    }
}

/// Storage contract for entity streams and their snapshots.
///
/// Implementations must:
/// - append a batch atomically (all or nothing)
/// - reject the append when `expected` does not match the stream head
/// - return events in ascending version order
/// - keep snapshots separate from events (`query_events` never returns snapshots)
#[async_trait]
pub trait EventStoreProvider: Send + Sync {
    /// Current head version of the stream (`0` when empty).
    async fn stream_version(&self, stream: &StreamKey) -> Result<u64, EventStoreError>;

    /// Append already-versioned events (`expected + 1 ..`) to one stream.
    async fn append_events(
        &self,
        stream: &StreamKey,
        events: Vec<EventEnvelope>,
        expected: ExpectedVersion,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// Events with `version > after_version`, ascending, at most `limit`.
    async fn query_events(
        &self,
        stream: &StreamKey,
        after_version: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    async fn query_latest_snapshot(&self, stream: &StreamKey) -> Result<Option<EventEnvelope>, EventStoreError>;

    async fn store_snapshot(&self, snapshot: EventEnvelope) -> Result<(), EventStoreError>;

    /// Remove every snapshot of the stream. Returns how many were removed.
    async fn delete_snapshots(&self, stream: &StreamKey) -> Result<usize, EventStoreError>;

    async fn search_events(&self, query: &EventSearchQuery) -> Result<EventSearchResult, EventStoreError>;

    /// Ids of every entity of the given type that has at least one event.
    async fn search_entity_ids(&self, entity_type_name: &str) -> Result<Vec<EntityId>, EventStoreError>;
}

#[async_trait]
impl<P> EventStoreProvider for Arc<P>
where
    P: EventStoreProvider + ?Sized,
{
    async fn stream_version(&self, stream: &StreamKey) -> Result<u64, EventStoreError> {
        (**self).stream_version(stream).await
    }

    async fn append_events(
        &self,
        stream: &StreamKey,
        events: Vec<EventEnvelope>,
        expected: ExpectedVersion,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).append_events(stream, events, expected).await
    }

    async fn query_events(
        &self,
        stream: &StreamKey,
        after_version: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).query_events(stream, after_version, limit).await
    }

    async fn query_latest_snapshot(&self, stream: &StreamKey) -> Result<Option<EventEnvelope>, EventStoreError> {
        (**self).query_latest_snapshot(stream).await
    }

    async fn store_snapshot(&self, snapshot: EventEnvelope) -> Result<(), EventStoreError> {
        (**self).store_snapshot(snapshot).await
    }

    async fn delete_snapshots(&self, stream: &StreamKey) -> Result<usize, EventStoreError> {
        (**self).delete_snapshots(stream).await
    }

    async fn search_events(&self, query: &EventSearchQuery) -> Result<EventSearchResult, EventStoreError> {
        (**self).search_events(query).await
    }

    async fn search_entity_ids(&self, entity_type_name: &str) -> Result<Vec<EntityId>, EventStoreError> {
        (**self).search_entity_ids(entity_type_name).await
    }
}
