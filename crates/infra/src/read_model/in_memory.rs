use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use cairn_core::{EntityId, ExpectedVersion};
use cairn_events::ReadModelKey;

use super::provider::{ReadModelRecord, ReadModelStoreError, ReadModelStoreProvider};
use crate::event_store::Pagination;

/// In-memory read-model store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReadModelStore {
    inner: RwLock<HashMap<String, BTreeMap<ReadModelKey, ReadModelRecord>>>,
}

impl InMemoryReadModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records of a read model in key order (test helper).
    pub fn list(&self, read_model_name: &str) -> Vec<ReadModelRecord> {
        self.inner
            .read()
            .map(|map| {
                map.get(read_model_name)
                    .map(|records| records.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn poisoned() -> ReadModelStoreError {
        ReadModelStoreError::Backend("lock poisoned".to_string())
    }
}

/// Only `{ "path": { "eq": value } }` conditions are supported; all must hold.
fn parse_filters(filters: &JsonValue) -> Result<Vec<(String, JsonValue)>, ReadModelStoreError> {
    let JsonValue::Object(fields) = filters else {
        return Err(ReadModelStoreError::UnsupportedFilter(format!("expected an object, got {filters}")));
    };

    fields
        .iter()
        .map(|(path, condition)| match condition {
            JsonValue::Object(ops) if ops.len() == 1 && ops.contains_key("eq") => {
                Ok((path.clone(), ops["eq"].clone()))
            }
            other => Err(ReadModelStoreError::UnsupportedFilter(format!("`{path}`: {other}"))),
        })
        .collect()
}

fn field<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

fn record_matches(record: &ReadModelRecord, conditions: &[(String, JsonValue)]) -> bool {
    conditions.iter().all(|(path, expected)| match field(&record.value, path) {
        Some(actual) => actual == expected,
        None if path == "id" => expected.as_str() == Some(record.key.id.as_str()),
        None => false,
    })
}

#[async_trait]
impl ReadModelStoreProvider for InMemoryReadModelStore {
    async fn fetch_read_model(
        &self,
        read_model_name: &str,
        key: &ReadModelKey,
    ) -> Result<Option<ReadModelRecord>, ReadModelStoreError> {
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map.get(read_model_name).and_then(|records| records.get(key)).cloned())
    }

    async fn fetch_sequence(
        &self,
        read_model_name: &str,
        id: &EntityId,
    ) -> Result<Vec<ReadModelRecord>, ReadModelStoreError> {
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map
            .get(read_model_name)
            .map(|records| {
                records
                    .values()
                    .filter(|r| &r.key.id == id && r.key.sequence.is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn search_read_models(
        &self,
        read_model_name: &str,
        filters: &JsonValue,
        pagination: Pagination,
    ) -> Result<Vec<ReadModelRecord>, ReadModelStoreError> {
        let conditions = parse_filters(filters)?;
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map
            .get(read_model_name)
            .map(|records| {
                records
                    .values()
                    .filter(|r| record_matches(r, &conditions))
                    .skip(pagination.offset as usize)
                    .take(pagination.limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_read_model(
        &self,
        read_model_name: &str,
        record: ReadModelRecord,
        expected: ExpectedVersion,
    ) -> Result<ReadModelRecord, ReadModelStoreError> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        let records = map.entry(read_model_name.to_string()).or_default();
        let current = records.get(&record.key).map(|r| r.version).unwrap_or(0);

        if !expected.matches(current) {
            return Err(ReadModelStoreError::Concurrency(format!(
                "{read_model_name}/{}: expected {expected:?}, found {current}",
                record.key
            )));
        }

        records.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn delete_read_model(&self, read_model_name: &str, key: &ReadModelKey) -> Result<bool, ReadModelStoreError> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(map
            .get_mut(read_model_name)
            .map(|records| records.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn clear(&self, read_model_name: &str) -> Result<usize, ReadModelStoreError> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(map.remove(read_model_name).map(|records| records.len()).unwrap_or(0))
    }
}
