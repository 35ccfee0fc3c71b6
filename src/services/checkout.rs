//! Checkout: cart → order → gateway charge, committed all at once.

use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, EntityTrait, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    config::AppConfig,
    entities::{
        order::{self, OrderStatus},
        user,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        addresses::AddressInput,
        carts::{self, CartOwner},
        gateway::{GatewayClient, PaymentMethodRequest, ReturnUrls},
        orders::{self, AssembleOrder, OrderCharges, OrderContact, OrderView},
        payments::{initiate_charge, ChargeCustomer, ChargeRequest, PaymentView},
    },
};

fn default_shipping_method() -> String {
    "standard".to_string()
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    pub shipping_address: AddressInput,
    /// Omitted billing bills to the shipping address
    #[serde(default)]
    pub billing_address: Option<AddressInput>,
    #[serde(default)]
    pub same_as_shipping: bool,
    #[serde(default = "default_shipping_method")]
    pub shipping_method: String,
    #[serde(default)]
    pub tax: Decimal,
    #[serde(default)]
    pub shipping_cost: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    pub payment_method: PaymentMethodRequest,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResponse {
    pub order: OrderView,
    pub payment: PaymentView,
    pub checkout_url: Option<String>,
    pub payment_session_id: Option<String>,
}

fn pick(requested: Option<&str>, fallback: Option<&str>) -> Option<String> {
    requested
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| fallback.map(str::trim).filter(|v| !v.is_empty()))
        .map(str::to_string)
}

/// Contact fields from the request, falling back to the signed-in profile.
fn resolve_contact(
    request: &CheckoutRequest,
    caller: Option<&AuthUser>,
    profile: Option<&user::Model>,
    default_country: &str,
) -> Result<OrderContact, ServiceError> {
    let missing = |field: &str| ServiceError::ValidationError(format!("{} is required", field));

    let email = pick(
        request.email.as_deref(),
        profile
            .map(|p| p.email.as_str())
            .or_else(|| caller.and_then(|c| c.email.as_deref())),
    )
    .ok_or_else(|| missing("email"))?;
    if !validator::validate_email(email.as_str()) {
        return Err(ServiceError::ValidationError(format!(
            "Invalid email '{}'",
            email
        )));
    }

    Ok(OrderContact {
        email,
        first_name: pick(
            request.first_name.as_deref(),
            profile.map(|p| p.first_name.as_str()),
        )
        .ok_or_else(|| missing("first_name"))?,
        last_name: pick(
            request.last_name.as_deref(),
            profile.map(|p| p.last_name.as_str()),
        )
        .ok_or_else(|| missing("last_name"))?,
        phone_number: pick(
            request.phone_number.as_deref(),
            profile.and_then(|p| p.phone_number.as_deref()),
        )
        .ok_or_else(|| missing("phone_number"))?,
        country_code: pick(
            request.country_code.as_deref(),
            profile.and_then(|p| p.country_code.as_deref()),
        )
        .unwrap_or_else(|| default_country.to_string())
        .to_ascii_uppercase(),
    })
}

/// Runs checkout for the caller's resolved cart.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<GatewayClient>,
    config: Arc<AppConfig>,
    event_sender: Arc<EventSender>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<GatewayClient>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            gateway,
            config,
            event_sender,
        }
    }

    /// Converts the caller's cart into an order and starts its payment.
    ///
    /// Assembly and the gateway charge share one transaction: stock shortfall,
    /// validation failures and gateway errors all leave the database as it
    /// was. Returns the response and any cart session token minted while
    /// resolving the cart.
    #[instrument(skip(self, caller, session_id, request), fields(user_id = ?caller.map(|c| c.user_id)))]
    pub async fn checkout(
        &self,
        caller: Option<&AuthUser>,
        session_id: Option<String>,
        request: CheckoutRequest,
    ) -> Result<(CheckoutResponse, Option<String>), ServiceError> {
        let user_id = caller.map(|c| c.user_id);
        let owner = CartOwner::new(user_id, session_id);

        let profile = match user_id {
            Some(id) => user::Entity::find_by_id(id).one(&*self.db).await?,
            None => None,
        };
        let contact = resolve_contact(
            &request,
            caller,
            profile.as_ref(),
            &self.config.default_country,
        )?;
        let currency = request
            .currency
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.config.default_currency)
            .to_ascii_uppercase();

        let billing = if request.same_as_shipping {
            None
        } else {
            request.billing_address.as_ref()
        };

        let txn = self.db.begin().await?;
        // The cart row stays locked until commit, so a concurrent checkout of
        // the same cart sees it emptied.
        let resolved = carts::resolve_in(&txn, &owner).await?;

        let assembled = orders::assemble_order(
            &txn,
            AssembleOrder {
                cart: &resolved.cart,
                user_id,
                session_id: resolved.cart.session_id.clone(),
                shipping_address: &request.shipping_address,
                billing_address: billing,
                shipping_method: request.shipping_method.trim().to_string(),
                charges: OrderCharges {
                    tax: request.tax,
                    shipping_cost: request.shipping_cost,
                    discount: request.discount,
                },
                contact: contact.clone(),
            },
        )
        .await?;
        let order_id = assembled.order.id;

        let charge = initiate_charge(
            &txn,
            &self.gateway,
            &ReturnUrls::from_frontend(self.config.frontend_base()),
            self.config.gateway.cancelled_status,
            ChargeRequest {
                reference_id: format!("order_{}", order_id),
                user_id,
                amount: assembled.order.total,
                currency,
                country: contact.country_code.clone(),
                description: Some(format!("Order {}", order_id)),
                method: &request.payment_method,
                customer: Some(ChargeCustomer {
                    reference: user_id
                        .map(|id| format!("customer_{}", id))
                        .unwrap_or_else(|| format!("guest_{}", order_id)),
                    email: contact.email.clone(),
                    given_names: contact.first_name.clone(),
                    surname: contact.last_name.clone(),
                    mobile_number: Some(contact.phone_number.clone()),
                }),
            },
        )
        .await;

        let (payment, links) = match charge {
            Ok(charge) => charge,
            Err(err) => {
                warn!(%order_id, error = %err, "payment initiation failed, rolling back checkout");
                txn.rollback().await?;
                return Err(err);
            }
        };

        let mut active: order::ActiveModel = assembled.order.into();
        active.payment_id = Set(Some(payment.id));
        active.status = Set(OrderStatus::Processing);
        let order = active.update(&txn).await?;

        txn.commit().await?;
        info!(%order_id, payment_id = %payment.id, total = %order.total, "checkout completed");

        for adjustment in assembled.adjustments {
            self.event_sender.send_or_log(adjustment.into()).await;
        }
        self.event_sender
            .send_or_log(Event::PaymentCreated {
                payment_id: payment.id,
                reference_id: payment.reference_id.clone(),
                payment_method: payment.payment_method.clone(),
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id,
                payment_id: payment.id,
                total: order.total,
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: OrderStatus::AwaitingPayment,
                new_status: OrderStatus::Processing,
            })
            .await;

        let order = orders::order_view(&*self.db, order).await?;
        Ok((
            CheckoutResponse {
                order,
                payment: payment.into(),
                checkout_url: links.checkout_url,
                payment_session_id: links.payment_session_id,
            },
            resolved.issued_session,
        ))
    }
}
