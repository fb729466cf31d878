//! Entity trait: identity + a stable type name for its event stream.

use serde::{Serialize, de::DeserializeOwned};

use crate::id::EntityId;

/// An event-sourced entity.
///
/// Entity state is never written directly; it is the fold of the entity's
/// events through the registered reducers (an entity-migration event swaps in
/// a whole new state). The serde bounds let the runtime
/// carry state as JSON inside snapshot envelopes.
pub trait Entity: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name used as `entityTypeName` in envelopes (e.g. "Cart").
    const TYPE_NAME: &'static str;

    /// Returns the entity identifier.
    fn id(&self) -> &EntityId;
}
