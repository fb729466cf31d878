//! Read-model storage: the provider contract and an in-memory implementation.

pub mod in_memory;
pub mod provider;

pub use in_memory::InMemoryReadModelStore;
pub use provider::{ReadModelRecord, ReadModelStoreError, ReadModelStoreProvider};
