//! Event store service: entity reconstruction, appends with retry, snapshots.

use std::sync::Arc;

use futures::stream::{self, Stream, TryStreamExt};
use tracing::{Span, instrument};

use cairn_core::{Entity, EntityId, ExpectedVersion};
use cairn_events::{EventEnvelope, Registry, StreamKey, decode_value, fold_entity};

use super::provider::{EventStoreError, EventStoreProvider};
use super::query::{EventSearchQuery, EventSearchResult, SearchTarget};
use crate::config::EventStoreConfig;
use crate::retry::{RetryError, retry_if};

/// Event store over a storage provider.
///
/// Entity state is never stored authoritatively: it is always the fold of the
/// stream, optionally resumed from the latest snapshot.
pub struct EventStore<P> {
    provider: P,
    registry: Arc<Registry>,
    config: EventStoreConfig,
}

impl<P> EventStore<P>
where
    P: EventStoreProvider,
{
    pub fn new(provider: P, registry: Arc<Registry>, config: EventStoreConfig) -> Self {
        Self {
            provider,
            registry,
            config,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Latest state of an entity as a snapshot envelope, or `None` if it has no history.
    #[instrument(skip(self), fields(entity_type = %entity_type_name, entity_id = %entity_id, folded = tracing::field::Empty), err)]
    pub async fn fetch_entity_snapshot(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
    ) -> Result<Option<EventEnvelope>, EventStoreError> {
        let stream = StreamKey::new(entity_type_name, entity_id.clone());
        let latest = self.provider.query_latest_snapshot(&stream).await?;
        let since = latest.as_ref().map(|s| s.version);

        let events = self
            .for_entity_since(entity_type_name, entity_id, since)
            .collect()
            .await?;

        let Some(folded) = fold_entity(&self.registry, &stream, latest.as_ref(), &events)? else {
            return Ok(None);
        };
        Span::current().record("folded", folded.applied);

        let interval = self.config.snapshot_interval;
        if interval > 0 && folded.applied as u64 >= interval {
            if let Err(err) = self.provider.store_snapshot(folded.snapshot.clone()).await {
                tracing::warn!(stream = %stream, version = folded.snapshot.version, error = %err, "failed to persist snapshot");
            }
        }

        Ok(Some(folded.snapshot))
    }

    pub async fn fetch_required_entity_snapshot(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
    ) -> Result<EventEnvelope, EventStoreError> {
        self.fetch_entity_snapshot(entity_type_name, entity_id)
            .await?
            .ok_or_else(|| EventStoreError::EntityNotFound {
                entity_type_name: entity_type_name.to_string(),
                entity_id: entity_id.clone(),
            })
    }

    /// Typed variant of [`Self::fetch_entity_snapshot`].
    pub async fn fetch_entity<E: Entity>(&self, entity_id: &EntityId) -> Result<Option<E>, EventStoreError> {
        match self.fetch_entity_snapshot(E::TYPE_NAME, entity_id).await? {
            Some(snapshot) => decode_value(&snapshot)
                .map(Some)
                .map_err(|e| EventStoreError::Reducer(e.to_string())),
            None => Ok(None),
        }
    }

    /// Append events, grouped per stream. Each stream is appended atomically;
    /// a failure on one stream stops the batch but leaves earlier streams stored.
    pub async fn store_events(&self, events: Vec<EventEnvelope>) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let mut stored = Vec::with_capacity(events.len());
        for (stream, batch) in group_by_stream(events) {
            stored.extend(self.store_stream_events(&stream, batch).await?);
        }
        Ok(stored)
    }

    /// Append events to one stream, assigning versions from the current head.
    /// Optimistic-concurrency conflicts re-read the head and retry.
    #[instrument(skip(self, events), fields(stream = %stream, event_count = events.len()), err)]
    pub async fn store_stream_events(
        &self,
        stream: &StreamKey,
        events: Vec<EventEnvelope>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        check_appendable(stream, &events)?;

        let result = retry_if(
            &self.config.append_retry,
            "append_events",
            EventStoreError::is_concurrency,
            |_attempt| {
                let events = events.clone();
                async move {
                    let head = self.provider.stream_version(stream).await?;
                    self.provider
                        .append_events(stream, numbered(events, head), ExpectedVersion::Exact(head))
                        .await
                }
            },
        )
        .await;

        match result {
            Ok(stored) => Ok(stored),
            Err(RetryError::Exhausted { attempts, last, .. }) => Err(EventStoreError::Concurrency(format!(
                "{stream}: gave up after {attempts} attempts ({last})"
            ))),
            Err(RetryError::Aborted(err)) => Err(err),
        }
    }

    /// Single guarded append: fails with `Concurrency` if the head is not at
    /// `expected`, without re-reading it.
    #[instrument(skip(self, events), fields(stream = %stream, event_count = events.len(), expected = ?expected), err)]
    pub async fn append_expecting(
        &self,
        stream: &StreamKey,
        events: Vec<EventEnvelope>,
        expected: ExpectedVersion,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        check_appendable(stream, &events)?;
        let head = match expected {
            ExpectedVersion::Exact(head) => head,
            ExpectedVersion::Any => self.provider.stream_version(stream).await?,
        };
        self.provider
            .append_events(stream, numbered(events, head), expected)
            .await
    }

    #[instrument(skip(self), fields(entity_type = %entity_type_name, entity_id = %entity_id), err)]
    pub async fn delete_entity_snapshots(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
    ) -> Result<usize, EventStoreError> {
        let stream = StreamKey::new(entity_type_name, entity_id.clone());
        self.provider.delete_snapshots(&stream).await
    }

    /// Lazy, re-queryable handle over the events after version `since` (all when `None`).
    pub fn for_entity_since(
        &self,
        entity_type_name: &str,
        entity_id: &EntityId,
        since: Option<u64>,
    ) -> EntityEvents<'_, P> {
        EntityEvents {
            provider: &self.provider,
            stream: StreamKey::new(entity_type_name, entity_id.clone()),
            since: since.unwrap_or(0),
            page_size: self.config.page_size.max(1),
        }
    }

    /// Authorized event search. The entity's event-stream authorizer is consulted
    /// before anything is returned.
    #[instrument(skip(self), err)]
    pub async fn search_events(&self, query: &EventSearchQuery) -> Result<EventSearchResult, EventStoreError> {
        let entity_type_name = match &query.target {
            SearchTarget::Entity { entity_type_name, .. } => entity_type_name.clone(),
            // spans every entity type, so no single authorizer can allow it
            SearchTarget::EventType { type_name } if self.registry.is_entity_migration(type_name) => {
                return Err(EventStoreError::AccessDenied(format!("`{type_name}` events are not searchable")));
            }
            SearchTarget::EventType { type_name } => self
                .registry
                .reducer_for(type_name)
                .map(|binding| binding.entity_type_name.clone())
                .ok_or_else(|| EventStoreError::RegistryLookup(format!("no reducer registered for event type `{type_name}`")))?,
        };

        if !self.registry.authorize_event_stream(&entity_type_name).is_allowed() {
            return Err(EventStoreError::AccessDenied(format!(
                "events of `{entity_type_name}` are not readable"
            )));
        }

        self.provider.search_events(query).await
    }

    pub async fn entity_ids(&self, entity_type_name: &str) -> Result<Vec<EntityId>, EventStoreError> {
        self.provider.search_entity_ids(entity_type_name).await
    }
}

fn check_appendable(stream: &StreamKey, events: &[EventEnvelope]) -> Result<(), EventStoreError> {
    for (idx, e) in events.iter().enumerate() {
        if !e.is_event() || e.stream_key() != *stream {
            return Err(EventStoreError::InvalidAppend(format!(
                "{stream}: record {idx} ({}, kind {:?}) cannot be appended here",
                e.stream_key(),
                e.kind
            )));
        }
    }
    Ok(())
}

/// Stamp versions `head + 1..` in order.
fn numbered(events: Vec<EventEnvelope>, head: u64) -> Vec<EventEnvelope> {
    events
        .into_iter()
        .zip(head + 1..)
        .map(|(mut e, version)| {
            e.version = version;
            e
        })
        .collect()
}

/// Group envelopes per stream, keeping first-seen stream order and in-stream order.
pub(crate) fn group_by_stream(events: Vec<EventEnvelope>) -> Vec<(StreamKey, Vec<EventEnvelope>)> {
    let mut groups: Vec<(StreamKey, Vec<EventEnvelope>)> = Vec::new();
    for event in events {
        let key = event.stream_key();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, batch)) => batch.push(event),
            None => groups.push((key, vec![event])),
        }
    }
    groups
}

/// Events of one stream after a version, read page by page on demand.
///
/// Each call to [`collect`](Self::collect) or [`stream`](Self::stream) queries
/// the provider again.
pub struct EntityEvents<'a, P> {
    provider: &'a P,
    stream: StreamKey,
    since: u64,
    page_size: usize,
}

impl<'a, P> EntityEvents<'a, P>
where
    P: EventStoreProvider,
{
    pub fn stream_key(&self) -> &StreamKey {
        &self.stream
    }

    async fn next_page(
        &self,
        cursor: Option<u64>,
    ) -> Result<Option<(Vec<EventEnvelope>, Option<u64>)>, EventStoreError> {
        let Some(after) = cursor else {
            return Ok(None);
        };
        let page = self.provider.query_events(&self.stream, after, self.page_size).await?;
        if page.is_empty() {
            return Ok(None);
        }
        let next = if page.len() < self.page_size {
            None
        } else {
            page.last().map(|e| e.version)
        };
        Ok(Some((page, next)))
    }

    /// Pages of events in ascending version order.
    pub fn pages(&self) -> impl Stream<Item = Result<Vec<EventEnvelope>, EventStoreError>> + '_ {
        stream::try_unfold(Some(self.since), move |cursor| self.next_page(cursor))
    }

    /// Events in ascending version order.
    pub fn stream(&self) -> impl Stream<Item = Result<EventEnvelope, EventStoreError>> + '_ {
        self.pages()
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, EventStoreError>)))
            .try_flatten()
    }

    pub async fn collect(&self) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.stream().try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use futures::StreamExt;

    use cairn_core::RequestId;
    use cairn_shop::{Cart, CartItemChanged};

    fn store(page_size: usize, snapshot_interval: u64) -> EventStore<InMemoryEventStore> {
        let registry = Arc::new(cairn_shop::registry().expect("shop registry"));
        let config = EventStoreConfig {
            page_size,
            snapshot_interval,
            ..EventStoreConfig::default()
        };
        EventStore::new(InMemoryEventStore::new(), registry, config)
    }

    fn changed(cart: &str, product: &str, quantity: u32) -> EventEnvelope {
        let event = CartItemChanged {
            cart_id: EntityId::from(cart),
            product_id: product.to_string(),
            quantity,
        };
        EventEnvelope::event(&event, RequestId::new()).expect("serializes")
    }

    #[tokio::test]
    async fn versions_are_assigned_from_the_stream_head() {
        let store = store(500, 1);
        let first = store
            .store_events(vec![changed("c1", "p1", 1), changed("c2", "p1", 1), changed("c1", "p2", 1)])
            .await
            .expect("append");
        let versions: Vec<_> = first.iter().map(|e| (e.entity_id.as_str(), e.version)).collect();
        assert_eq!(versions, vec![("c1", 1), ("c1", 2), ("c2", 1)]);

        let next = store.store_events(vec![changed("c1", "p3", 1)]).await.expect("append");
        assert_eq!(next[0].version, 3);
    }

    #[tokio::test]
    async fn guarded_append_fails_once_the_head_moved() {
        let store = store(500, 1);
        let stream = StreamKey::new(Cart::TYPE_NAME, EntityId::from("c1"));
        let stored = store
            .append_expecting(&stream, vec![changed("c1", "p1", 1)], ExpectedVersion::Exact(0))
            .await
            .expect("head at 0");
        assert_eq!(stored[0].version, 1);

        let err = store
            .append_expecting(&stream, vec![changed("c1", "p2", 1)], ExpectedVersion::Exact(0))
            .await
            .unwrap_err();
        assert!(err.is_concurrency());
        assert_eq!(store.provider.stream_version(&stream).await.expect("head"), 1);
    }

    #[tokio::test]
    async fn events_are_read_page_by_page() {
        let store = store(2, 1);
        let batch: Vec<_> = (0..5).map(|n| changed("c1", &format!("p{n}"), 1)).collect();
        store.store_events(batch).await.expect("append");

        let id = EntityId::from("c1");
        let events = store.for_entity_since(Cart::TYPE_NAME, &id, None);
        let pages: Vec<usize> = events
            .pages()
            .map(|page| page.map(|p| p.len()).unwrap_or(0))
            .collect()
            .await;
        assert_eq!(pages, vec![2, 2, 1]);

        let tail = store.for_entity_since(Cart::TYPE_NAME, &id, Some(3)).collect().await.expect("read");
        assert_eq!(tail.iter().map(|e| e.version).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn snapshot_interval_zero_never_persists() {
        let store = store(500, 0);
        store.store_events(vec![changed("c1", "p1", 1)]).await.expect("append");
        let id = EntityId::from("c1");

        let cart: Cart = store.fetch_entity(&id).await.expect("fold").expect("exists");
        assert_eq!(cart.cart_items.len(), 1);
        let stream = StreamKey::new(Cart::TYPE_NAME, id);
        assert_eq!(store.provider().snapshot_count(&stream), 0);
    }

    #[tokio::test]
    async fn missing_entity_is_not_found() {
        let store = store(500, 1);
        let err = store
            .fetch_required_entity_snapshot(Cart::TYPE_NAME, &EntityId::from("nope"))
            .await
            .expect_err("no history");
        assert!(matches!(err, EventStoreError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn appends_reject_foreign_records() {
        let store = store(500, 1);
        let stream = StreamKey::new(Cart::TYPE_NAME, EntityId::from("c1"));
        let err = store
            .store_stream_events(&stream, vec![changed("c2", "p1", 1)])
            .await
            .expect_err("wrong stream");
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }

    #[tokio::test]
    async fn search_by_unknown_event_type_is_a_lookup_error() {
        let store = store(500, 1);
        let err = store
            .search_events(&EventSearchQuery::by_type("NoSuchEvent"))
            .await
            .expect_err("unknown type");
        assert!(matches!(err, EventStoreError::RegistryLookup(_)));
    }
}
