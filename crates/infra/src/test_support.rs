//! Shared fixtures for infra tests: recording provider wrappers and a shop runtime.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;

use cairn_core::{EntityId, ExpectedVersion, RequestId};
use cairn_events::{Event, EventEnvelope, InMemoryEventBus, ReadModelChange, ReadModelKey, Registry, StreamKey, encode};
use cairn_shop::{CartChecked, CartItemChanged, PaymentConfirmed};

use crate::config::RuntimeConfig;
use crate::event_store::{EventSearchQuery, EventSearchResult, EventStoreError, EventStoreProvider, InMemoryEventStore, Pagination};
use crate::read_model::{InMemoryReadModelStore, ReadModelRecord, ReadModelStoreError, ReadModelStoreProvider};
use crate::retry::RetryPolicy;
use crate::runtime::Runtime;

/// Event store that can lose the next `n` append races, or let another writer
/// slip an event in right before the next append.
#[derive(Debug, Default)]
pub(crate) struct RecordingEventStore {
    pub inner: InMemoryEventStore,
    conflicts: AtomicU32,
    appends: AtomicU32,
    interleaved: Mutex<Option<EventEnvelope>>,
}

impl RecordingEventStore {
    pub fn conflict_next(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Append `event` at its stream's head just before the next append lands.
    pub fn interleave_append(&self, event: EventEnvelope) {
        if let Ok(mut slot) = self.interleaved.lock() {
            *slot = Some(event);
        }
    }

    pub fn append_calls(&self) -> u32 {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStoreProvider for RecordingEventStore {
    async fn stream_version(&self, stream: &StreamKey) -> Result<u64, EventStoreError> {
        self.inner.stream_version(stream).await
    }

    async fn append_events(
        &self,
        stream: &StreamKey,
        events: Vec<EventEnvelope>,
        expected: ExpectedVersion,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        let lost_race = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost_race {
            return Err(EventStoreError::Concurrency(format!("{stream}: injected conflict")));
        }
        let other_writer = self.interleaved.lock().ok().and_then(|mut slot| slot.take());
        if let Some(mut event) = other_writer {
            let head = self.inner.stream_version(&event.stream_key()).await?;
            event.version = head + 1;
            self.inner
                .append_events(&event.stream_key(), vec![event], ExpectedVersion::Exact(head))
                .await?;
        }
        self.inner.append_events(stream, events, expected).await
    }

    async fn query_events(
        &self,
        stream: &StreamKey,
        after_version: u64,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.inner.query_events(stream, after_version, limit).await
    }

    async fn query_latest_snapshot(&self, stream: &StreamKey) -> Result<Option<EventEnvelope>, EventStoreError> {
        self.inner.query_latest_snapshot(stream).await
    }

    async fn store_snapshot(&self, snapshot: EventEnvelope) -> Result<(), EventStoreError> {
        self.inner.store_snapshot(snapshot).await
    }

    async fn delete_snapshots(&self, stream: &StreamKey) -> Result<usize, EventStoreError> {
        self.inner.delete_snapshots(stream).await
    }

    async fn search_events(&self, query: &EventSearchQuery) -> Result<EventSearchResult, EventStoreError> {
        self.inner.search_events(query).await
    }

    async fn search_entity_ids(&self, entity_type_name: &str) -> Result<Vec<EntityId>, EventStoreError> {
        self.inner.search_entity_ids(entity_type_name).await
    }
}

/// Read-model store that records fetched keys and can simulate a concurrent
/// writer bumping a record right before the next `n` upserts land.
#[derive(Debug, Default)]
pub(crate) struct RecordingReadModelStore {
    pub inner: InMemoryReadModelStore,
    interleaved_writes: AtomicU32,
    fetched: Mutex<Vec<ReadModelKey>>,
    rejected: Mutex<Vec<(ExpectedVersion, u64)>>,
}

impl RecordingReadModelStore {
    pub fn interleave_next(&self, n: u32) {
        self.interleaved_writes.store(n, Ordering::SeqCst);
    }

    pub fn fetched_keys(&self) -> Vec<ReadModelKey> {
        self.fetched.lock().map(|k| k.clone()).unwrap_or_default()
    }

    /// `(expected, stored version)` of every upsert the inner store rejected.
    pub fn rejected_writes(&self) -> Vec<(ExpectedVersion, u64)> {
        self.rejected.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReadModelStoreProvider for RecordingReadModelStore {
    async fn fetch_read_model(
        &self,
        read_model_name: &str,
        key: &ReadModelKey,
    ) -> Result<Option<ReadModelRecord>, ReadModelStoreError> {
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(key.clone());
        }
        self.inner.fetch_read_model(read_model_name, key).await
    }

    async fn fetch_sequence(
        &self,
        read_model_name: &str,
        id: &EntityId,
    ) -> Result<Vec<ReadModelRecord>, ReadModelStoreError> {
        self.inner.fetch_sequence(read_model_name, id).await
    }

    async fn search_read_models(
        &self,
        read_model_name: &str,
        filters: &JsonValue,
        pagination: Pagination,
    ) -> Result<Vec<ReadModelRecord>, ReadModelStoreError> {
        self.inner.search_read_models(read_model_name, filters, pagination).await
    }

    async fn upsert_read_model(
        &self,
        read_model_name: &str,
        record: ReadModelRecord,
        expected: ExpectedVersion,
    ) -> Result<ReadModelRecord, ReadModelStoreError> {
        let interleave = self
            .interleaved_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if interleave && let Some(current) = self.inner.fetch_read_model(read_model_name, &record.key).await? {
            let bumped = ReadModelRecord {
                version: current.version + 1,
                updated_at: Utc::now(),
                ..current.clone()
            };
            self.inner
                .upsert_read_model(read_model_name, bumped, ExpectedVersion::Exact(current.version))
                .await?;
        }

        let result = self.inner.upsert_read_model(read_model_name, record.clone(), expected).await;
        if let Err(err) = &result
            && err.is_concurrency()
        {
            let stored = self
                .inner
                .fetch_read_model(read_model_name, &record.key)
                .await?
                .map(|r| r.version)
                .unwrap_or(0);
            if let Ok(mut rejected) = self.rejected.lock() {
                rejected.push((expected, stored));
            }
        }
        result
    }

    async fn delete_read_model(&self, read_model_name: &str, key: &ReadModelKey) -> Result<bool, ReadModelStoreError> {
        self.inner.delete_read_model(read_model_name, key).await
    }

    async fn clear(&self, read_model_name: &str) -> Result<usize, ReadModelStoreError> {
        self.inner.clear(read_model_name).await
    }
}

pub(crate) type TestBus = Arc<InMemoryEventBus<ReadModelChange>>;
pub(crate) type TestRuntime = Runtime<Arc<RecordingEventStore>, Arc<RecordingReadModelStore>, TestBus>;

pub(crate) struct Harness {
    pub runtime: TestRuntime,
    pub events: Arc<RecordingEventStore>,
    pub read_models: Arc<RecordingReadModelStore>,
}

/// Defaults with immediate retries so conflict tests never sleep.
pub(crate) fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.event_store.append_retry = RetryPolicy::immediate(3);
    config.projections.retry = RetryPolicy::immediate(3);
    config
}

pub(crate) fn shop_registry() -> Arc<Registry> {
    match cairn_shop::registry() {
        Ok(registry) => Arc::new(registry),
        Err(err) => panic!("shop registry is invalid: {err}"),
    }
}

pub(crate) fn harness() -> Harness {
    let events = Arc::new(RecordingEventStore::default());
    let read_models = Arc::new(RecordingReadModelStore::default());
    let runtime = Runtime::new(
        test_config(),
        shop_registry(),
        events.clone(),
        read_models.clone(),
        Arc::new(InMemoryEventBus::new()),
    )
    .expect("valid test config");
    Harness {
        runtime,
        events,
        read_models,
    }
}

pub(crate) fn envelope<E: Event>(event: &E) -> EventEnvelope {
    EventEnvelope::event(event, RequestId::new()).expect("event serializes")
}

/// Raw JSON batch, as an external caller would send it.
pub(crate) fn raw_batch(envelopes: &[EventEnvelope]) -> JsonValue {
    encode(envelopes).expect("envelopes serialize")
}

pub(crate) fn item_changed(cart_id: &str, product_id: &str, quantity: u32) -> EventEnvelope {
    envelope(&CartItemChanged {
        cart_id: EntityId::from(cart_id),
        product_id: product_id.to_string(),
        quantity,
    })
}

pub(crate) fn cart_checked(cart_id: &str) -> EventEnvelope {
    envelope(&CartChecked {
        cart_id: EntityId::from(cart_id),
        checked_at: Utc::now(),
    })
}

pub(crate) fn payment_confirmed(payment_id: &str, cart_id: &str) -> EventEnvelope {
    envelope(&PaymentConfirmed {
        payment_id: EntityId::from(payment_id),
        cart_id: EntityId::from(cart_id),
        payment_method: "card".to_string(),
        amount_cents: 4_200,
        confirmed_at: Utc::now(),
    })
}
