use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::supports_row_locks,
    entities::{cart, cart_item},
    errors::ServiceError,
    services::catalog,
};

/// Caller identity a cart is resolved for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartOwner {
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
}

impl CartOwner {
    pub fn new(user_id: Option<Uuid>, session_id: Option<String>) -> Self {
        Self {
            user_id,
            session_id: session_id.filter(|s| !s.trim().is_empty()),
        }
    }
}

/// A resolved cart plus the session token minted for it, if any. The caller
/// must hand a minted token back to the client.
#[derive(Debug, Clone)]
pub struct ResolvedCart {
    pub cart: cart::Model,
    pub issued_session: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CartLineView {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub product_name: String,
    pub variant_name: Option<String>,
    pub quantity: i32,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub line_total: Decimal,
    pub in_stock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CartView {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub items: Vec<CartLineView>,
    #[schema(value_type = String)]
    pub subtotal: Decimal,
    pub item_count: i32,
}

/// Largest quantity a single cart line may hold.
pub const MAX_LINE_QUANTITY: i32 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct AddToCartRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[serde(default = "default_quantity")]
    #[validate(range(min = 1, max = 10000, message = "Quantity must be between 1 and 10000"))]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateCartItemRequest {
    /// New quantity; zero or less removes the line
    pub quantity: i32,
}

/// Locates, merges and mutates carts for anonymous sessions and users.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds or creates the active cart for `owner` in its own transaction.
    #[instrument(skip(self))]
    pub async fn resolve(&self, owner: &CartOwner) -> Result<ResolvedCart, ServiceError> {
        let txn = self.db.begin().await?;
        let resolved = resolve_in(&txn, owner).await?;
        txn.commit().await?;
        Ok(resolved)
    }

    #[instrument(skip(self))]
    pub async fn get_cart(&self, owner: &CartOwner) -> Result<(CartView, Option<String>), ServiceError> {
        let resolved = self.resolve(owner).await?;
        let view = cart_view(&*self.db, &resolved.cart).await?;
        Ok((view, resolved.issued_session))
    }

    /// Adds to the line for the same (product, variant) or creates one.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        owner: &CartOwner,
        input: AddToCartRequest,
    ) -> Result<(CartView, Option<String>), ServiceError> {
        input.validate()?;

        let txn = self.db.begin().await?;
        let entry = catalog::load_entry(&txn, input.product_id).await?;
        if !entry.product.is_active {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is not available",
                input.product_id
            )));
        }
        match input.variant_id {
            Some(variant_id) if entry.variant(variant_id).is_none() => {
                return Err(ServiceError::NotFound(format!(
                    "Variant {} of product {} not found",
                    variant_id, input.product_id
                )));
            }
            None if !entry.variants.is_empty() => {
                return Err(ServiceError::ValidationError(
                    "A variant must be chosen for this product".to_string(),
                ));
            }
            _ => {}
        }

        let resolved = resolve_in(&txn, owner).await?;
        let cart_id = resolved.cart.id;

        let existing = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(input.product_id))
            .filter(variant_filter(input.variant_id))
            .one(&txn)
            .await?;

        match existing {
            Some(item) => {
                let quantity = combined_quantity(item.quantity, input.quantity)?;
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(quantity);
                item.update(&txn).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    product_id: Set(input.product_id),
                    variant_id: Set(input.variant_id),
                    quantity: Set(input.quantity),
                    created_at: Set(Utc::now()),
                }
                .insert(&txn)
                .await?;
            }
        }
        touch(&txn, resolved.cart.clone()).await?;
        txn.commit().await?;

        info!(%cart_id, product_id = %input.product_id, quantity = input.quantity, "added item to cart");
        let view = cart_view(&*self.db, &resolved.cart).await?;
        Ok((view, resolved.issued_session))
    }

    /// Sets a line's quantity; zero or less deletes the line.
    #[instrument(skip(self))]
    pub async fn update_item(
        &self,
        owner: &CartOwner,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<(CartView, Option<String>), ServiceError> {
        let txn = self.db.begin().await?;
        let resolved = resolve_in(&txn, owner).await?;
        let item = find_line(&txn, resolved.cart.id, item_id).await?;

        if quantity > MAX_LINE_QUANTITY {
            return Err(quantity_limit_error());
        }
        if quantity <= 0 {
            item.delete(&txn).await?;
        } else {
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.update(&txn).await?;
        }
        touch(&txn, resolved.cart.clone()).await?;
        txn.commit().await?;

        let view = cart_view(&*self.db, &resolved.cart).await?;
        Ok((view, resolved.issued_session))
    }

    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        owner: &CartOwner,
        item_id: Uuid,
    ) -> Result<(CartView, Option<String>), ServiceError> {
        let txn = self.db.begin().await?;
        let resolved = resolve_in(&txn, owner).await?;
        find_line(&txn, resolved.cart.id, item_id)
            .await?
            .delete(&txn)
            .await?;
        touch(&txn, resolved.cart.clone()).await?;
        txn.commit().await?;

        let view = cart_view(&*self.db, &resolved.cart).await?;
        Ok((view, resolved.issued_session))
    }

    #[instrument(skip(self))]
    pub async fn clear(&self, owner: &CartOwner) -> Result<(CartView, Option<String>), ServiceError> {
        let txn = self.db.begin().await?;
        let resolved = resolve_in(&txn, owner).await?;
        clear_items(&txn, resolved.cart.id).await?;
        touch(&txn, resolved.cart.clone()).await?;
        txn.commit().await?;

        let view = cart_view(&*self.db, &resolved.cart).await?;
        Ok((view, resolved.issued_session))
    }
}

fn quantity_limit_error() -> ServiceError {
    ServiceError::ValidationError(format!(
        "A cart line may hold at most {} units",
        MAX_LINE_QUANTITY
    ))
}

/// Sum of two line quantities, refused past `MAX_LINE_QUANTITY`.
fn combined_quantity(current: i32, added: i32) -> Result<i32, ServiceError> {
    current
        .checked_add(added)
        .filter(|q| *q <= MAX_LINE_QUANTITY)
        .ok_or_else(quantity_limit_error)
}

fn variant_filter(variant_id: Option<Uuid>) -> sea_orm::Condition {
    let column = cart_item::Column::VariantId;
    sea_orm::Condition::all().add(match variant_id {
        Some(id) => column.eq(id),
        None => column.is_null(),
    })
}

async fn find_line<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
    item_id: Uuid,
) -> Result<cart_item::Model, ServiceError> {
    cart_item::Entity::find_by_id(item_id)
        .filter(cart_item::Column::CartId.eq(cart_id))
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))
}

async fn touch<C: ConnectionTrait>(conn: &C, cart: cart::Model) -> Result<(), ServiceError> {
    let mut active: cart::ActiveModel = cart.into();
    active.updated_at = Set(Utc::now());
    active.update(conn).await?;
    Ok(())
}

async fn find_cart<C: ConnectionTrait>(
    conn: &C,
    filter: sea_orm::Condition,
) -> Result<Option<cart::Model>, ServiceError> {
    let mut query = cart::Entity::find().filter(filter);
    if supports_row_locks(conn) {
        query = query.lock_exclusive();
    }
    Ok(query.one(conn).await?)
}

async fn create_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Option<Uuid>,
    session_id: Option<String>,
) -> Result<cart::Model, ServiceError> {
    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        session_id: Set(session_id),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;
    debug!(cart_id = %cart.id, ?user_id, "created cart");
    Ok(cart)
}

/// Resolves the cart for `owner` inside the caller's transaction.
///
/// An authenticated caller gets their own cart; an anonymous cart for the
/// same session is merged into it and deleted. Lines merge only when both
/// product and variant match.
pub async fn resolve_in<C: ConnectionTrait>(
    conn: &C,
    owner: &CartOwner,
) -> Result<ResolvedCart, ServiceError> {
    if let Some(user_id) = owner.user_id {
        let cart = match find_cart(
            conn,
            sea_orm::Condition::all().add(cart::Column::UserId.eq(user_id)),
        )
        .await?
        {
            Some(cart) => cart,
            None => create_cart(conn, Some(user_id), None).await?,
        };

        if let Some(session_id) = owner.session_id.as_deref() {
            let anonymous = find_cart(
                conn,
                sea_orm::Condition::all()
                    .add(cart::Column::SessionId.eq(session_id))
                    .add(cart::Column::UserId.is_null()),
            )
            .await?;
            if let Some(anonymous) = anonymous {
                merge_into(conn, &anonymous, &cart).await?;
            }
        }

        return Ok(ResolvedCart {
            cart,
            issued_session: None,
        });
    }

    if let Some(session_id) = owner.session_id.as_deref() {
        let existing = find_cart(
            conn,
            sea_orm::Condition::all().add(cart::Column::SessionId.eq(session_id)),
        )
        .await?;
        let cart = match existing {
            Some(cart) => cart,
            None => create_cart(conn, None, Some(session_id.to_string())).await?,
        };
        return Ok(ResolvedCart {
            cart,
            issued_session: None,
        });
    }

    let token = Uuid::new_v4().to_string();
    let cart = create_cart(conn, None, Some(token.clone())).await?;
    Ok(ResolvedCart {
        cart,
        issued_session: Some(token),
    })
}

async fn merge_into<C: ConnectionTrait>(
    conn: &C,
    source: &cart::Model,
    target: &cart::Model,
) -> Result<(), ServiceError> {
    let target_items = load_items(conn, target.id).await?;

    for item in load_items(conn, source.id).await? {
        let matching = target_items
            .iter()
            .find(|t| t.product_id == item.product_id && t.variant_id == item.variant_id);
        match matching {
            Some(existing) => {
                let mut active: cart_item::ActiveModel = existing.clone().into();
                // Merged lines clamp at the limit.
                let quantity = existing
                    .quantity
                    .saturating_add(item.quantity)
                    .min(MAX_LINE_QUANTITY);
                active.quantity = Set(quantity);
                active.update(conn).await?;
                item.delete(conn).await?;
            }
            None => {
                let mut active: cart_item::ActiveModel = item.into();
                active.cart_id = Set(target.id);
                active.update(conn).await?;
            }
        }
    }

    source.clone().delete(conn).await?;
    info!(source = %source.id, target = %target.id, "merged anonymous cart");
    Ok(())
}

pub async fn load_items<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<cart_item::Model>, ServiceError> {
    Ok(cart_item::Entity::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .order_by_asc(cart_item::Column::Id)
        .all(conn)
        .await?)
}

/// Empties a cart without deleting it.
pub async fn clear_items<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<u64, ServiceError> {
    let result = cart_item::Entity::delete_many()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Builds the priced view of a cart from live catalog prices.
pub async fn cart_view<C: ConnectionTrait>(
    conn: &C,
    cart: &cart::Model,
) -> Result<CartView, ServiceError> {
    let items = load_items(conn, cart.id).await?;
    let product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
    let entries = catalog::load_entries(conn, &product_ids).await?;

    let mut lines = Vec::with_capacity(items.len());
    for item in items {
        let entry = entries.get(&item.product_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Product {} not found", item.product_id))
        })?;
        let unit_price = entry.unit_price(item.variant_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Variant {:?} not found", item.variant_id))
        })?;
        let available = entry.available(item.variant_id).unwrap_or(0);

        lines.push(CartLineView {
            id: item.id,
            product_id: item.product_id,
            variant_id: item.variant_id,
            product_name: entry.product.name.clone(),
            variant_name: item
                .variant_id
                .and_then(|id| entry.variant(id))
                .map(|v| v.name.clone()),
            quantity: item.quantity,
            unit_price,
            line_total: unit_price * Decimal::from(item.quantity),
            in_stock: available >= item.quantity,
        });
    }

    Ok(CartView {
        id: cart.id,
        user_id: cart.user_id,
        subtotal: lines.iter().map(|l| l.line_total).sum(),
        item_count: lines
            .iter()
            .fold(0i32, |count, l| count.saturating_add(l.quantity)),
        items: lines,
    })
}
