use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_core::{Entity, EntityId};
use cairn_events::{Event, RegistryBuilder};

/// Entity: Payment. Joined onto carts through `cartId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: EntityId,
    pub cart_id: EntityId,
    pub payment_method: String,
    pub amount_cents: u64,
    pub confirmed_at: DateTime<Utc>,
}

impl Entity for Payment {
    const TYPE_NAME: &'static str = "Payment";

    fn id(&self) -> &EntityId {
        &self.id
    }
}

/// Event: PaymentConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfirmed {
    pub payment_id: EntityId,
    pub cart_id: EntityId,
    pub payment_method: String,
    pub amount_cents: u64,
    pub confirmed_at: DateTime<Utc>,
}

impl Event for PaymentConfirmed {
    const TYPE_NAME: &'static str = "PaymentConfirmed";
    type Entity = Payment;

    fn entity_id(&self) -> EntityId {
        self.payment_id.clone()
    }
}

pub fn confirm(event: &PaymentConfirmed, _old: Option<&Payment>) -> Payment {
    Payment {
        id: event.payment_id.clone(),
        cart_id: event.cart_id.clone(),
        payment_method: event.payment_method.clone(),
        amount_cents: event.amount_cents,
        confirmed_at: event.confirmed_at,
    }
}

pub(crate) fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .entity::<Payment>()
        .reducer::<PaymentConfirmed, _>("confirm", confirm)
}
