//! Append-only event store boundary.
//!
//! [`EventStoreProvider`] is the storage contract (one implementation per
//! backend); [`EventStore`] is the service the runtime talks to. It folds
//! streams into entity state, assigns versions on append and retries
//! optimistic-concurrency conflicts.

pub mod in_memory;
pub mod provider;
pub mod query;
pub mod store;

pub use in_memory::InMemoryEventStore;
pub use provider::{EventStoreError, EventStoreProvider};
pub use query::{EventSearchQuery, EventSearchResult, Pagination, SearchTarget};
pub use store::{EntityEvents, EventStore};
