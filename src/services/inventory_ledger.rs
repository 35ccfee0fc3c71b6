//! Race-safe stock adjustments for products and variants.
//!
//! Every function takes the caller's connection so adjustments join the
//! caller's transaction; a shortfall error must abort that transaction.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QuerySelect, Set,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    db::supports_row_locks,
    entities::{product, product_variant},
    errors::ServiceError,
    events::Event,
};

/// One (product, variant) quantity to reserve or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
}

/// Result of a single committed-to-transaction adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockAdjustment {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub delta: i32,
    pub new_stock: i32,
}

impl From<StockAdjustment> for Event {
    fn from(adj: StockAdjustment) -> Self {
        Event::StockAdjusted {
            product_id: adj.product_id,
            variant_id: adj.variant_id,
            delta: adj.delta,
            new_stock: adj.new_stock,
        }
    }
}

/// Canonical lock order: product id, then variant id (product-level first).
pub fn sort_for_locking(lines: &mut [StockLine]) {
    lines.sort_by_key(|line| (line.product_id, line.variant_id));
}

pub(crate) async fn lock_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<product::Model, ServiceError> {
    let mut query = product::Entity::find_by_id(product_id);
    if supports_row_locks(conn) {
        query = query.lock_exclusive();
    }
    query
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
}

pub(crate) async fn lock_variant<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    variant_id: Uuid,
) -> Result<product_variant::Model, ServiceError> {
    let mut query = product_variant::Entity::find_by_id(variant_id)
        .filter(product_variant::Column::ProductId.eq(product_id));
    if supports_row_locks(conn) {
        query = query.lock_exclusive();
    }
    query.one(conn).await?.ok_or_else(|| {
        ServiceError::NotFound(format!(
            "Variant {} of product {} not found",
            variant_id, product_id
        ))
    })
}

/// Read-modify-write one stock counter under an exclusive row lock.
///
/// A negative `delta` that would drive stock below zero fails with
/// `InsufficientStock`; positive deltas have no ceiling.
#[instrument(skip(conn))]
pub async fn adjust_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    variant_id: Option<Uuid>,
    delta: i32,
) -> Result<StockAdjustment, ServiceError> {
    let product = lock_product(conn, product_id).await?;

    let new_stock = match variant_id {
        Some(variant_id) => {
            let variant = lock_variant(conn, product_id, variant_id).await?;
            let new_stock = checked_stock(variant.stock, delta, product_id, Some(variant_id))?;
            let mut active: product_variant::ActiveModel = variant.into();
            active.stock = Set(new_stock);
            active.update(conn).await?;
            new_stock
        }
        None => {
            let variant_count = product_variant::Entity::find()
                .filter(product_variant::Column::ProductId.eq(product_id))
                .count(conn)
                .await?;
            if variant_count > 0 && delta < 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Product {} is sold by variant; a variant must be chosen",
                    product_id
                )));
            }
            let new_stock = checked_stock(product.stock, delta, product_id, None)?;
            let mut active: product::ActiveModel = product.into();
            active.stock = Set(new_stock);
            active.updated_at = Set(Utc::now());
            active.update(conn).await?;
            new_stock
        }
    };

    debug!(%product_id, ?variant_id, delta, new_stock, "stock adjusted");
    Ok(StockAdjustment {
        product_id,
        variant_id,
        delta,
        new_stock,
    })
}

fn checked_stock(
    current: i32,
    delta: i32,
    product_id: Uuid,
    variant_id: Option<Uuid>,
) -> Result<i32, ServiceError> {
    let next = current.checked_add(delta).ok_or_else(|| {
        ServiceError::ValidationError("Stock adjustment overflows".to_string())
    })?;
    if delta < 0 && next < 0 {
        warn!(%product_id, ?variant_id, current, requested = -delta, "insufficient stock");
        return Err(ServiceError::InsufficientStock {
            product_id,
            variant_id,
        });
    }
    Ok(next)
}

/// Decrements every line, locking in canonical order.
pub async fn reserve<C: ConnectionTrait>(
    conn: &C,
    lines: &[StockLine],
) -> Result<Vec<StockAdjustment>, ServiceError> {
    apply(conn, lines, -1).await
}

/// Restores every line, locking in canonical order. No floor check applies.
pub async fn release<C: ConnectionTrait>(
    conn: &C,
    lines: &[StockLine],
) -> Result<Vec<StockAdjustment>, ServiceError> {
    apply(conn, lines, 1).await
}

async fn apply<C: ConnectionTrait>(
    conn: &C,
    lines: &[StockLine],
    sign: i32,
) -> Result<Vec<StockAdjustment>, ServiceError> {
    let mut ordered = lines.to_vec();
    sort_for_locking(&mut ordered);

    let mut adjustments = Vec::with_capacity(ordered.len());
    for line in ordered {
        adjustments.push(adjust_stock(conn, line.product_id, line.variant_id, sign * line.quantity).await?);
    }
    Ok(adjustments)
}
