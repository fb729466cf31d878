use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use cairn_core::{EntityId, ExpectedVersion};
use cairn_events::{EventEnvelope, StreamKey};

use super::provider::{EventStoreError, EventStoreProvider};
use super::query::{EventSearchQuery, EventSearchResult};

#[derive(Debug, Default)]
struct StreamData {
    events: Vec<EventEnvelope>,
    snapshots: Vec<EventEnvelope>,
}

impl StreamData {
    fn current_version(&self) -> u64 {
        self.events.last().map(|e| e.version).unwrap_or(0)
    }
}

/// In-memory event store provider.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, StreamData>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event across all streams (test helper).
    pub fn all_events(&self) -> Vec<EventEnvelope> {
        self.streams
            .read()
            .map(|streams| streams.values().flat_map(|s| s.events.iter().cloned()).collect())
            .unwrap_or_default()
    }

    pub fn snapshot_count(&self, stream: &StreamKey) -> usize {
        self.streams
            .read()
            .map(|streams| streams.get(stream).map(|s| s.snapshots.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn poisoned() -> EventStoreError {
        EventStoreError::Backend("lock poisoned".to_string())
    }
}

#[async_trait]
impl EventStoreProvider for InMemoryEventStore {
    async fn stream_version(&self, stream: &StreamKey) -> Result<u64, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        Ok(streams.get(stream).map(StreamData::current_version).unwrap_or(0))
    }

    async fn append_events(
        &self,
        stream: &StreamKey,
        events: Vec<EventEnvelope>,
        expected: ExpectedVersion,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut streams = self.streams.write().map_err(|_| Self::poisoned())?;
        let data = streams.entry(stream.clone()).or_default();
        let current = data.current_version();

        if !expected.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "{stream}: expected {expected:?}, found {current}"
            )));
        }

        let mut next = current + 1;
        for (idx, e) in events.iter().enumerate() {
            if !e.is_event() {
                return Err(EventStoreError::InvalidAppend(format!(
                    "{stream}: record {idx} is a snapshot"
                )));
            }
            if e.entity_type_name != stream.entity_type_name || e.entity_id != stream.entity_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "{stream}: record {idx} belongs to {}",
                    e.stream_key()
                )));
            }
            if e.version != next {
                return Err(EventStoreError::InvalidAppend(format!(
                    "{stream}: record {idx} has version {}, expected {next}",
                    e.version
                )));
            }
            next += 1;
        }

        data.events.extend(events.iter().cloned());
        Ok(events)
    }

    async fn query_events(
        &self,
        stream: &StreamKey,
        after_version: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        Ok(streams
            .get(stream)
            .map(|data| {
                data.events
                    .iter()
                    .filter(|e| e.version > after_version)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_latest_snapshot(&self, stream: &StreamKey) -> Result<Option<EventEnvelope>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        Ok(streams
            .get(stream)
            .and_then(|data| data.snapshots.iter().max_by_key(|s| s.version).cloned()))
    }

    async fn store_snapshot(&self, snapshot: EventEnvelope) -> Result<(), EventStoreError> {
        if !snapshot.is_snapshot() {
            return Err(EventStoreError::InvalidAppend(format!(
                "{}: store_snapshot called with an event",
                snapshot.stream_key()
            )));
        }
        let mut streams = self.streams.write().map_err(|_| Self::poisoned())?;
        let data = streams.entry(snapshot.stream_key()).or_default();
        data.snapshots.retain(|s| s.version != snapshot.version);
        data.snapshots.push(snapshot);
        Ok(())
    }

    async fn delete_snapshots(&self, stream: &StreamKey) -> Result<usize, EventStoreError> {
        let mut streams = self.streams.write().map_err(|_| Self::poisoned())?;
        Ok(streams
            .get_mut(stream)
            .map(|data| std::mem::take(&mut data.snapshots).len())
            .unwrap_or(0))
    }

    async fn search_events(&self, query: &EventSearchQuery) -> Result<EventSearchResult, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        let mut matches: Vec<&EventEnvelope> = streams
            .values()
            .flat_map(|data| data.events.iter())
            .filter(|e| query.matches(e))
            .collect();

        // newest first; ties keep stream order
        matches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.stream_key().cmp(&b.stream_key()))
                .then_with(|| a.version.cmp(&b.version))
        });

        let total = matches.len() as u64;
        let offset = query.pagination.offset as usize;
        let limit = query.pagination.limit as usize;
        let events: Vec<EventEnvelope> = matches.into_iter().skip(offset).take(limit).cloned().collect();
        let has_more = (offset + events.len()) < total as usize;

        Ok(EventSearchResult {
            events,
            total,
            pagination: query.pagination,
            has_more,
        })
    }

    async fn search_entity_ids(&self, entity_type_name: &str) -> Result<Vec<EntityId>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        let ids: BTreeSet<EntityId> = streams
            .iter()
            .filter(|(key, data)| key.entity_type_name == entity_type_name && !data.events.is_empty())
            .map(|(key, _)| key.entity_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }
}
