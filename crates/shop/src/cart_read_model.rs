//! `CartReadModel`: one record per cart, fed by both `Cart` and `Payment`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use cairn_core::EntityId;
use cairn_events::{ProjectionResult, ReadModel, ReadModelKey, ReadModelRequest, RegistryBuilder};

use crate::cart::{Address, Cart, CartItem};
use crate::payment::Payment;

/// Requests for this id are rejected by [`CartReadModel::before_fn`].
pub const THROW_EXCEPTION_ID: &str = "throw-exception-id";
pub const BEFORE_HOOK_EXCEPTION: &str = "before hook rejected the request";

/// Requests for this id are redirected by [`CartReadModel::before_fn_v2`].
pub const REWRITTEN_ID: &str = "before-fn-test";
pub const MODIFIED_SUFFIX: &str = "-modified";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartReadModel {
    pub id: EntityId,
    pub cart_items: Vec<CartItem>,
    pub checks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cart_items_ids: Option<Vec<String>>,
}

impl ReadModel for CartReadModel {
    const TYPE_NAME: &'static str = "CartReadModel";
}

impl CartReadModel {
    /// Projection from `Cart`, joined on `id`. Keeps any payment already recorded.
    pub fn update_with_cart(cart: &Cart, old: Option<&CartReadModel>) -> ProjectionResult<CartReadModel> {
        ProjectionResult::Upsert(CartReadModel {
            id: cart.id.clone(),
            cart_items: cart.cart_items.clone(),
            checks: cart.checks,
            shipping_address: cart.shipping_address.clone(),
            payment: old.and_then(|rm| rm.payment.clone()),
            cart_items_ids: Some(cart.cart_items.iter().map(|i| i.product_id.clone()).collect()),
        })
    }

    /// Projection from `Payment`, joined on `cartId`. Only `payment` changes: every
    /// cart-derived field, `cartItemsIds` included, is kept as the cart projection left it.
    pub fn update_cart_payment_status(
        payment: &Payment,
        old: Option<&CartReadModel>,
    ) -> ProjectionResult<CartReadModel> {
        let Some(old) = old else {
            return ProjectionResult::Upsert(CartReadModel {
                id: payment.cart_id.clone(),
                cart_items: Vec::new(),
                checks: 0,
                shipping_address: None,
                payment: Some(payment.clone()),
                cart_items_ids: None,
            });
        };

        ProjectionResult::Upsert(CartReadModel {
            payment: Some(payment.clone()),
            ..old.clone()
        })
    }

    /// Rejects any request keyed by [`THROW_EXCEPTION_ID`].
    pub fn before_fn(request: ReadModelRequest) -> anyhow::Result<ReadModelRequest> {
        if request.key.as_ref().map(|k| k.id.as_str()) == Some(THROW_EXCEPTION_ID) {
            anyhow::bail!(BEFORE_HOOK_EXCEPTION);
        }
        Ok(request)
    }

    /// Redirects [`REWRITTEN_ID`] to `REWRITTEN_ID + MODIFIED_SUFFIX`, by key or by `id.eq` filter.
    pub fn before_fn_v2(request: ReadModelRequest) -> anyhow::Result<ReadModelRequest> {
        let id = match &request.key {
            Some(key) => Some(key.id.as_str().to_string()),
            None => request
                .filters
                .as_ref()
                .and_then(|f| f.pointer("/id/eq"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };

        let Some(id) = id.filter(|id| id == REWRITTEN_ID) else {
            return Ok(request);
        };
        let new_id = format!("{id}{MODIFIED_SUFFIX}");
        tracing::debug!(read_model = %request.read_model_name, from = %id, to = %new_id, "rewriting cart read model request");

        if request.key.is_some() {
            Ok(ReadModelRequest {
                key: Some(ReadModelKey::new(new_id)),
                ..request
            })
        } else {
            Ok(ReadModelRequest {
                filters: Some(json!({ "id": { "eq": new_id } })),
                ..request
            })
        }
    }
}

pub(crate) fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .read_model::<CartReadModel>()
        .projection::<Cart, CartReadModel, _>("id", "updateWithCart", CartReadModel::update_with_cart)
        .projection::<Payment, CartReadModel, _>(
            "cartId",
            "updateCartPaymentStatus",
            CartReadModel::update_cart_payment_status,
        )
        .before_hook::<CartReadModel, _>(CartReadModel::before_fn)
        .before_hook::<CartReadModel, _>(CartReadModel::before_fn_v2)
}
