use serde::{Serialize, de::DeserializeOwned};

use cairn_core::{Entity, EntityId};

/// A domain event: an immutable fact recorded on exactly one entity stream.
///
/// The payload is stored as the envelope's `value`; the stream it lands on is
/// `(Self::Entity::TYPE_NAME, self.entity_id())`.
pub trait Event: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event type name (e.g. "CartItemChanged"). Must be unique per registry.
    const TYPE_NAME: &'static str;

    /// The entity whose state this event folds into.
    type Entity: Entity;

    /// Identifier of the entity stream this event belongs to.
    fn entity_id(&self) -> EntityId;
}
