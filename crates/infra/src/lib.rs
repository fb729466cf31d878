//! Infrastructure layer: storage providers, the event store service,
//! projections, dispatch and the runtime facade.

pub mod config;
pub mod dispatcher;
pub mod event_store;
pub mod migration;
pub mod projections;
pub mod read_model;
pub mod retry;
pub mod runtime;

#[cfg(test)]
mod test_support;


pub use config::{ConfigError, EventStoreConfig, ProjectionConfig, RuntimeConfig};
pub use dispatcher::{DispatchError, DispatchFailure, DispatchReport, DispatchStage, EventDispatcher};
pub use event_store::{
    EntityEvents, EventSearchQuery, EventSearchResult, EventStore, EventStoreError, EventStoreProvider,
    InMemoryEventStore, Pagination, SearchTarget,
};
pub use migration::{DataMigrationCoordinator, MigrationError};
pub use projections::{
    EntityRefresh, ProjectionEngine, ProjectionError, ProjectionFailure, ProjectionOutcome, ReplayError,
    ReplayHandle, ReplayPhase, ReplayProgress,
};
pub use read_model::{InMemoryReadModelStore, ReadModelRecord, ReadModelStoreError, ReadModelStoreProvider};
pub use retry::{BackoffStrategy, RetryError, RetryPolicy};
pub use runtime::{Runtime, RuntimeError};
