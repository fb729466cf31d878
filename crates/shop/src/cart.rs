use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_core::{Entity, EntityId};
use cairn_events::{Event, RegistryBuilder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub first_name: String,
    pub last_name: String,
    pub country: String,
    pub state: String,
    pub postal_code: String,
    pub address: String,
}

/// Entity: Cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub id: EntityId,
    pub cart_items: Vec<CartItem>,
    pub checks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

impl Cart {
    fn empty(id: EntityId) -> Self {
        Self {
            id,
            cart_items: Vec::new(),
            checks: 0,
            shipping_address: None,
            checked_at: None,
        }
    }
}

impl Entity for Cart {
    const TYPE_NAME: &'static str = "Cart";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

/// Event: CartItemChanged. A quantity of `0` removes the product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemChanged {
    pub cart_id: EntityId,
    pub product_id: String,
    pub quantity: u32,
}

impl Event for CartItemChanged {
    const TYPE_NAME: &'static str = "CartItemChanged";
    type Entity = Cart;

    fn entity_id(&self) -> EntityId {
        self.cart_id.clone()
    }
}

/// Event: ShippingAddressUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddressUpdated {
    pub cart_id: EntityId,
    pub address: Address,
}

impl Event for ShippingAddressUpdated {
    const TYPE_NAME: &'static str = "ShippingAddressUpdated";
    type Entity = Cart;

    fn entity_id(&self) -> EntityId {
        self.cart_id.clone()
    }
}

/// Event: CartChecked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartChecked {
    pub cart_id: EntityId,
    pub checked_at: DateTime<Utc>,
}

impl Event for CartChecked {
    const TYPE_NAME: &'static str = "CartChecked";
    type Entity = Cart;

    fn entity_id(&self) -> EntityId {
        self.cart_id.clone()
    }
}

pub fn change_item(event: &CartItemChanged, old: Option<&Cart>) -> Cart {
    let mut cart = old.cloned().unwrap_or_else(|| Cart::empty(event.cart_id.clone()));

    match cart
        .cart_items
        .iter()
        .position(|item| item.product_id == event.product_id)
    {
        Some(idx) if event.quantity == 0 => {
            cart.cart_items.remove(idx);
        }
        Some(idx) => cart.cart_items[idx].quantity = event.quantity,
        None if event.quantity == 0 => {}
        None => cart.cart_items.push(CartItem {
            product_id: event.product_id.clone(),
            quantity: event.quantity,
        }),
    }

    cart
}

pub fn update_shipping_address(event: &ShippingAddressUpdated, old: Option<&Cart>) -> Cart {
    let mut cart = old.cloned().unwrap_or_else(|| Cart::empty(event.cart_id.clone()));
    cart.shipping_address = Some(event.address.clone());
    cart
}

pub fn check(event: &CartChecked, old: Option<&Cart>) -> Cart {
    let mut cart = old.cloned().unwrap_or_else(|| Cart::empty(event.cart_id.clone()));
    cart.checks += 1;
    cart.checked_at = Some(event.checked_at);
    cart
}

pub(crate) fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .entity::<Cart>()
        .reducer::<CartItemChanged, _>("changeItem", change_item)
        .reducer::<ShippingAddressUpdated, _>("updateShippingAddress", update_shipping_address)
        .reducer::<CartChecked, _>("check", check)
}
