//! Shop sample domain (carts and payments).
//!
//! Pure domain code used to exercise the runtime end to end: entities, events,
//! reducers, and a read model fed by two entity types.

pub mod cart;
pub mod cart_read_model;
pub mod payment;

use cairn_events::{Registry, RegistryBuilder, RegistryError};

pub use cart::{Address, Cart, CartChecked, CartItem, CartItemChanged, ShippingAddressUpdated};
pub use cart_read_model::{BEFORE_HOOK_EXCEPTION, CartReadModel, MODIFIED_SUFFIX, REWRITTEN_ID, THROW_EXCEPTION_ID};
pub use payment::{Payment, PaymentConfirmed};

/// Add every shop entity, reducer, read model and projection to `builder`.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    let builder = cart::register(builder);
    let builder = payment::register(builder);
    cart_read_model::register(builder)
}

/// Registry containing only the shop domain (plus the built-in migration entity).
pub fn registry() -> Result<Registry, RegistryError> {
    register(Registry::builder()).build()
}
