use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use cairn_core::{EntityId, ExpectedVersion};
use cairn_events::ReadModelKey;

use crate::event_store::Pagination;

/// One stored read-model record with its concurrency metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModelRecord {
    pub key: ReadModelKey,
    /// Starts at 1 on first write, +1 per write.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub value: JsonValue,
}

#[derive(Debug, Error)]
pub enum ReadModelStoreError {
    /// Stale write: the stored version is not the expected one.
    #[error("read model optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("unsupported read model filter: {0}")]
    UnsupportedFilter(String),

    #[error("read model backend error: {0}")]
    Backend(String),
}

impl ReadModelStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, ReadModelStoreError::Concurrency(_))
    }
}

/// Storage contract for disposable read models.
///
/// Every write is a compare-and-swap on the record version; no locks are taken.
#[async_trait]
pub trait ReadModelStoreProvider: Send + Sync {
    async fn fetch_read_model(
        &self,
        read_model_name: &str,
        key: &ReadModelKey,
    ) -> Result<Option<ReadModelRecord>, ReadModelStoreError>;

    /// Every record of a sequenced read model for one id, ordered by sequence value.
    async fn fetch_sequence(
        &self,
        read_model_name: &str,
        id: &EntityId,
    ) -> Result<Vec<ReadModelRecord>, ReadModelStoreError>;

    /// Filter records with `{ "<field path>": { "eq": <value> }, ... }`.
    async fn search_read_models(
        &self,
        read_model_name: &str,
        filters: &JsonValue,
        pagination: Pagination,
    ) -> Result<Vec<ReadModelRecord>, ReadModelStoreError>;

    /// Write `record` if the stored version matches `expected` (`0` = absent).
    async fn upsert_read_model(
        &self,
        read_model_name: &str,
        record: ReadModelRecord,
        expected: ExpectedVersion,
    ) -> Result<ReadModelRecord, ReadModelStoreError>;

    /// Returns whether a record was removed.
    async fn delete_read_model(&self, read_model_name: &str, key: &ReadModelKey) -> Result<bool, ReadModelStoreError>;

    /// Drop every record of a read model (rebuild support).
    async fn clear(&self, read_model_name: &str) -> Result<usize, ReadModelStoreError>;
}

#[async_trait]
impl<S> ReadModelStoreProvider for Arc<S>
where
    S: ReadModelStoreProvider + ?Sized,
{
    async fn fetch_read_model(
        &self,
        read_model_name: &str,
        key: &ReadModelKey,
    ) -> Result<Option<ReadModelRecord>, ReadModelStoreError> {
        (**self).fetch_read_model(read_model_name, key).await
    }

    async fn fetch_sequence(
        &self,
        read_model_name: &str,
        id: &EntityId,
    ) -> Result<Vec<ReadModelRecord>, ReadModelStoreError> {
        (**self).fetch_sequence(read_model_name, id).await
    }

    async fn search_read_models(
        &self,
        read_model_name: &str,
        filters: &JsonValue,
        pagination: Pagination,
    ) -> Result<Vec<ReadModelRecord>, ReadModelStoreError> {
        (**self).search_read_models(read_model_name, filters, pagination).await
    }

    async fn upsert_read_model(
        &self,
        read_model_name: &str,
        record: ReadModelRecord,
        expected: ExpectedVersion,
    ) -> Result<ReadModelRecord, ReadModelStoreError> {
        (**self).upsert_read_model(read_model_name, record, expected).await
    }

    async fn delete_read_model(&self, read_model_name: &str, key: &ReadModelKey) -> Result<bool, ReadModelStoreError> {
        (**self).delete_read_model(read_model_name, key).await
    }

    async fn clear(&self, read_model_name: &str) -> Result<usize, ReadModelStoreError> {
        (**self).clear(read_model_name).await
    }
}
