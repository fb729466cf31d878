//! `cairn-events` — event envelopes, the registry and the pure entity fold.
//!
//! Nothing in this crate performs IO. Storage, retries and the projection
//! pipeline live in `cairn-infra`.

pub mod authorization;
pub mod bus;
pub mod codec;
pub mod envelope;
pub mod event;
pub mod fold;
pub mod in_memory_bus;
pub mod migration;
pub mod projection;
pub mod registry;

pub use authorization::{Access, EventStreamAuthorizer, allow_access, deny_access};
pub use bus::{EventBus, Subscription};
pub use codec::{CodecError, decode_raw, decode_raw_str, decode_value, encode};
pub use envelope::{EnvelopeKind, EventEnvelope, StreamKey};
pub use event::Event;
pub use fold::{FoldError, FoldedEntity, fold_entity};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use migration::{
    DataMigrationEntity, DataMigrationFinished, DataMigrationStarted, DataMigrationStatus, EntityMigrated,
};
pub use projection::{
    ChangeKind, ProjectionResult, ReadModel, ReadModelChange, ReadModelKey, ReadModelRequest,
    SequenceKey,
};
pub use registry::{
    BeforeHook, EntityBinding, HookError, ProjectionBinding, ProjectionFn, ReadModelBinding,
    ReducerBinding, ReducerFn, Registry, RegistryBuilder, RegistryError,
};
