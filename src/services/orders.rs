use crate::{
    auth::AuthUser,
    db::supports_row_locks,
    entities::{
        address::AddressType,
        cart,
        order::{self, order_total, OrderStatus},
        order_item, payment,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        addresses::{self, AddressInput, AddressView},
        carts, catalog,
        inventory_ledger::{self, StockAdjustment, StockLine},
        payments::PaymentView,
    },
    PaginatedResponse,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

const DEFAULT_PER_PAGE: u64 = 10;
const ADMIN_PER_PAGE: u64 = 20;
const MAX_PER_PAGE: u64 = 100;

/// Caller-supplied monetary adjustments applied on top of the item subtotal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderCharges {
    pub tax: Decimal,
    pub shipping_cost: Decimal,
    pub discount: Decimal,
}

impl OrderCharges {
    fn validate(&self) -> Result<(), ServiceError> {
        for (name, value) in [
            ("tax", self.tax),
            ("shipping_cost", self.shipping_cost),
            ("discount", self.discount),
        ] {
            if value < Decimal::ZERO {
                return Err(ServiceError::ValidationError(format!(
                    "{} must not be negative",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Denormalized contact fields carried on every order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderContact {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub country_code: String,
    pub phone_number: String,
}

/// Everything needed to turn a cart into an order.
#[derive(Debug, Clone)]
pub struct AssembleOrder<'a> {
    pub cart: &'a cart::Model,
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub shipping_address: &'a AddressInput,
    /// `None` bills to the shipping address
    pub billing_address: Option<&'a AddressInput>,
    pub shipping_method: String,
    pub charges: OrderCharges,
    pub contact: OrderContact,
}

/// An order written inside the caller's transaction, not yet committed.
#[derive(Debug, Clone)]
pub struct AssembledOrder {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub adjustments: Vec<StockAdjustment>,
}

/// Converts `input.cart` into an `awaiting_payment` order on `conn`.
///
/// Lines are processed in canonical lock order. Each line's stock is checked
/// and decremented under the ledger's row lock and its unit price is frozen
/// into the order item. The cart is emptied and totals are computed last.
/// `input.cart` must have been resolved on `conn` so its row lock is held.
/// Any error must abort the caller's transaction.
#[instrument(skip(conn, input), fields(cart_id = %input.cart.id, user_id = ?input.user_id))]
pub async fn assemble_order<C: ConnectionTrait>(
    conn: &C,
    input: AssembleOrder<'_>,
) -> Result<AssembledOrder, ServiceError> {
    let cart_items = carts::load_items(conn, input.cart.id).await?;
    if cart_items.is_empty() {
        return Err(ServiceError::EmptyCart);
    }
    input.charges.validate()?;

    let shipping = addresses::get_or_create(
        conn,
        input.shipping_address,
        AddressType::Shipping,
        input.user_id,
    )
    .await?;
    let billing = match input.billing_address {
        Some(billing) => {
            addresses::get_or_create(conn, billing, AddressType::Billing, input.user_id).await?
        }
        None => shipping.clone(),
    };

    let now = Utc::now();
    let order = order::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(input.user_id),
        session_id: Set(input.session_id.clone()),
        shipping_address_id: Set(shipping.id),
        billing_address_id: Set(billing.id),
        payment_id: Set(None),
        email: Set(input.contact.email.clone()),
        first_name: Set(input.contact.first_name.clone()),
        last_name: Set(input.contact.last_name.clone()),
        country_code: Set(input.contact.country_code.clone()),
        phone_number: Set(input.contact.phone_number.clone()),
        status: Set(OrderStatus::AwaitingPayment),
        shipping_method: Set(input.shipping_method.clone()),
        subtotal: Set(Decimal::ZERO),
        tax: Set(Decimal::ZERO),
        shipping_cost: Set(Decimal::ZERO),
        discount: Set(Decimal::ZERO),
        total: Set(Decimal::ZERO),
        tracking_number: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;

    let mut lines: Vec<StockLine> = cart_items
        .iter()
        .map(|item| StockLine {
            product_id: item.product_id,
            variant_id: item.variant_id,
            quantity: item.quantity,
        })
        .collect();
    inventory_ledger::sort_for_locking(&mut lines);

    let product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
    let entries = catalog::load_entries(conn, &product_ids).await?;

    let mut items = Vec::with_capacity(lines.len());
    let mut adjustments = Vec::with_capacity(lines.len());
    for line in &lines {
        if line.quantity < 1 {
            return Err(ServiceError::ValidationError(format!(
                "Invalid quantity {} for product {}",
                line.quantity, line.product_id
            )));
        }
        let entry = entries.get(&line.product_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Product {} not found", line.product_id))
        })?;
        if !entry.product.is_active {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is no longer available",
                line.product_id
            )));
        }

        let adjustment = inventory_ledger::adjust_stock(
            conn,
            line.product_id,
            line.variant_id,
            -line.quantity,
        )
        .await?;

        let price = entry.unit_price(line.variant_id).ok_or_else(|| {
            ServiceError::NotFound(format!(
                "Variant {:?} of product {} not found",
                line.variant_id, line.product_id
            ))
        })?;

        let item = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(line.product_id),
            variant_id: Set(line.variant_id),
            quantity: Set(line.quantity),
            price: Set(price),
            created_at: Set(now),
        }
        .insert(conn)
        .await?;

        items.push(item);
        adjustments.push(adjustment);
    }

    let cleared = carts::clear_items(conn, input.cart.id).await?;
    debug!(cart_id = %input.cart.id, cleared, "cart emptied into order");

    let subtotal: Decimal = items.iter().map(order_item::Model::line_total).sum();
    let charges = input.charges;
    let total = order_total(subtotal, charges.tax, charges.shipping_cost, charges.discount);
    if total <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Order total must be greater than zero".to_string(),
        ));
    }

    let mut active: order::ActiveModel = order.into();
    active.subtotal = Set(subtotal);
    active.tax = Set(charges.tax);
    active.shipping_cost = Set(charges.shipping_cost);
    active.discount = Set(charges.discount);
    active.total = Set(total);
    let order = active.update(conn).await?;

    info!(order_id = %order.id, %subtotal, %total, lines = items.len(), "order assembled");
    Ok(AssembledOrder {
        order,
        items,
        adjustments,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemView {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    /// Unit price frozen at checkout
    pub price: Decimal,
    pub line_total: Decimal,
}

impl From<order_item::Model> for OrderItemView {
    fn from(m: order_item::Model) -> Self {
        Self {
            line_total: m.line_total(),
            id: m.id,
            product_id: m.product_id,
            variant_id: m.variant_id,
            quantity: m.quantity,
            price: m.price,
        }
    }
}

/// Order with its lines, addresses and linked payment.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderView {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: OrderStatus,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub country_code: String,
    pub phone_number: String,
    pub shipping_method: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping_cost: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub tracking_number: Option<String>,
    pub items: Vec<OrderItemView>,
    pub shipping_address: Option<AddressView>,
    pub billing_address: Option<AddressView>,
    pub payment: Option<PaymentView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderView {
    fn build(
        order: order::Model,
        items: Vec<order_item::Model>,
        shipping: Option<AddressView>,
        billing: Option<AddressView>,
        payment: Option<PaymentView>,
    ) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            status: order.status,
            email: order.email,
            first_name: order.first_name,
            last_name: order.last_name,
            country_code: order.country_code,
            phone_number: order.phone_number,
            shipping_method: order.shipping_method,
            subtotal: order.subtotal,
            tax: order.tax,
            shipping_cost: order.shipping_cost,
            discount: order.discount,
            total: order.total,
            tracking_number: order.tracking_number,
            items: items.into_iter().map(OrderItemView::from).collect(),
            shipping_address: shipping,
            billing_address: billing,
            payment,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// Loads lines, addresses and payments for a batch of orders.
pub async fn order_views<C: ConnectionTrait>(
    conn: &C,
    orders: Vec<order::Model>,
) -> Result<Vec<OrderView>, ServiceError> {
    if orders.is_empty() {
        return Ok(Vec::new());
    }

    let order_ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
    let mut items_by_order: HashMap<Uuid, Vec<order_item::Model>> = HashMap::new();
    for item in order_item::Entity::find()
        .filter(order_item::Column::OrderId.is_in(order_ids))
        .order_by_asc(order_item::Column::ProductId)
        .order_by_asc(order_item::Column::VariantId)
        .all(conn)
        .await?
    {
        items_by_order.entry(item.order_id).or_default().push(item);
    }

    let address_ids: Vec<Uuid> = orders
        .iter()
        .flat_map(|o| [o.shipping_address_id, o.billing_address_id])
        .collect();
    let addresses: HashMap<Uuid, AddressView> = crate::entities::address::Entity::find()
        .filter(crate::entities::address::Column::Id.is_in(address_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|a| (a.id, AddressView::from(a)))
        .collect();

    let payment_ids: Vec<Uuid> = orders.iter().filter_map(|o| o.payment_id).collect();
    let payments: HashMap<Uuid, payment::Model> = if payment_ids.is_empty() {
        HashMap::new()
    } else {
        payment::Entity::find()
            .filter(payment::Column::Id.is_in(payment_ids))
            .all(conn)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect()
    };

    Ok(orders
        .into_iter()
        .map(|order| {
            let items = items_by_order.remove(&order.id).unwrap_or_default();
            let shipping = addresses.get(&order.shipping_address_id).cloned();
            let billing = addresses.get(&order.billing_address_id).cloned();
            let payment = order
                .payment_id
                .and_then(|id| payments.get(&id).cloned())
                .map(PaymentView::from);
            OrderView::build(order, items, shipping, billing, payment)
        })
        .collect())
}

pub async fn order_view<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<OrderView, ServiceError> {
    order_views(conn, vec![order])
        .await?
        .pop()
        .ok_or_else(|| ServiceError::InternalError("order view missing".to_string()))
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct OrderListQuery {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub per_page: Option<u64>,
    #[serde(default)]
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct GuestOrderQuery {
    pub email: Option<String>,
}

/// Operational override; not checked against the lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AdminOrderUpdate {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub tracking_number: Option<String>,
}

/// Order queries, cancellation and admin overrides.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    async fn find(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                warn!(%order_id, "order not found");
                ServiceError::NotFound(format!("Order {} not found", order_id))
            })
    }

    /// Owner or admin read.
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn get(&self, caller: &AuthUser, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let order = self.find(order_id).await?;
        if !caller.can_access(order.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        order_view(&*self.db, order).await
    }

    /// Guest lookup: the order must have no owner and the email must match.
    #[instrument(skip(self, email))]
    pub async fn get_guest(
        &self,
        order_id: Uuid,
        email: Option<&str>,
    ) -> Result<OrderView, ServiceError> {
        let email = email
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ServiceError::BadRequest("Email is required".to_string()))?;

        let order = self.find(order_id).await?;
        if order.user_id.is_some() || !order.email.eq_ignore_ascii_case(email) {
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        order_view(&*self.db, order).await
    }

    #[instrument(skip(self))]
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        query: OrderListQuery,
    ) -> Result<PaginatedResponse<OrderView>, ServiceError> {
        self.list(Some(user_id), query, DEFAULT_PER_PAGE).await
    }

    #[instrument(skip(self))]
    pub async fn list_admin(
        &self,
        query: OrderListQuery,
    ) -> Result<PaginatedResponse<OrderView>, ServiceError> {
        self.list(None, query, ADMIN_PER_PAGE).await
    }

    async fn list(
        &self,
        user_id: Option<Uuid>,
        query: OrderListQuery,
        default_per_page: u64,
    ) -> Result<PaginatedResponse<OrderView>, ServiceError> {
        let page = query.page.unwrap_or(1).max(1);
        let per_page = query.per_page.unwrap_or(default_per_page).clamp(1, MAX_PER_PAGE);

        let mut select = order::Entity::find();
        if let Some(user_id) = user_id {
            select = select.filter(order::Column::UserId.eq(user_id));
        }
        if let Some(status) = query.status {
            select = select.filter(order::Column::Status.eq(status));
        }

        let paginator = select
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;
        let items = order_views(&*self.db, orders).await?;

        debug!(total, page, per_page, returned = items.len(), "orders listed");
        Ok(PaginatedResponse::new(items, total, page, per_page))
    }

    /// Cancels an order that has not started processing and restores its
    /// reserved stock in the same transaction.
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn cancel(&self, caller: &AuthUser, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let txn = self.db.begin().await?;

        let mut query = order::Entity::find_by_id(order_id);
        if supports_row_locks(&txn) {
            query = query.lock_exclusive();
        }
        let order = query
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !caller.can_access(order.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        if !order.status.is_cancellable() {
            return Err(ServiceError::Conflict(format!(
                "Order in status {} cannot be cancelled",
                order.status
            )));
        }

        let lines: Vec<StockLine> = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|item| StockLine {
                product_id: item.product_id,
                variant_id: item.variant_id,
                quantity: item.quantity,
            })
            .collect();
        let adjustments = inventory_ledger::release(&txn, &lines).await?;

        let old_status = order.status;
        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Cancelled);
        let order = active.update(&txn).await?;

        txn.commit().await?;
        info!(%order_id, %old_status, restored = adjustments.len(), "order cancelled");

        for adjustment in adjustments {
            self.event_sender.send_or_log(adjustment.into()).await;
        }
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status: OrderStatus::Cancelled,
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;

        order_view(&*self.db, order).await
    }

    /// Sets status and/or tracking number without lifecycle checks. Stock is
    /// not touched.
    #[instrument(skip(self, update))]
    pub async fn admin_update(
        &self,
        order_id: Uuid,
        update: AdminOrderUpdate,
    ) -> Result<OrderView, ServiceError> {
        let order = self.find(order_id).await?;
        let old_status = order.status;

        let mut active: order::ActiveModel = order.clone().into();
        if let Some(status) = update.status {
            active.status = Set(status);
        }
        if let Some(tracking) = update.tracking_number {
            let tracking = tracking.trim().to_string();
            active.tracking_number = Set((!tracking.is_empty()).then_some(tracking));
        }
        let order = if active.is_changed() {
            active.update(&*self.db).await?
        } else {
            order
        };

        if order.status != old_status {
            info!(%order_id, %old_status, new_status = %order.status, "order status overridden");
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id,
                    old_status,
                    new_status: order.status,
                })
                .await;
        }

        order_view(&*self.db, order).await
    }

    /// True when the user has a delivered or completed order containing the
    /// product.
    #[instrument(skip(self))]
    pub async fn user_has_purchased(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let order_ids: Vec<Uuid> = order::Entity::find()
            .select_only()
            .column(order::Column::Id)
            .filter(order::Column::UserId.eq(user_id))
            .filter(
                order::Column::Status.is_in([OrderStatus::Delivered, OrderStatus::Completed]),
            )
            .into_tuple()
            .all(&*self.db)
            .await?;
        if order_ids.is_empty() {
            return Ok(false);
        }

        let count = order_item::Entity::find()
            .filter(order_item::Column::OrderId.is_in(order_ids))
            .filter(order_item::Column::ProductId.eq(product_id))
            .count(&*self.db)
            .await?;
        Ok(count > 0)
    }
}
