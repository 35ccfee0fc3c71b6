//! Read-side catalog lookups shared by the cart and order paths.

use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    entities::{product, product_variant},
    errors::ServiceError,
};

/// A product with its variants in creation order.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub product: product::Model,
    pub variants: Vec<product_variant::Model>,
}

impl CatalogEntry {
    pub fn variant(&self, variant_id: Uuid) -> Option<&product_variant::Model> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    /// Live unit price for a line: the variant's price, else the product's
    /// display price.
    pub fn unit_price(&self, variant_id: Option<Uuid>) -> Option<Decimal> {
        match variant_id {
            Some(id) => self.variant(id).map(product_variant::Model::price),
            None => Some(self.product.display_price(&self.variants)),
        }
    }

    /// Stock available for a line: the variant's stock, else the product's
    /// total stock.
    pub fn available(&self, variant_id: Option<Uuid>) -> Option<i32> {
        match variant_id {
            Some(id) => self.variant(id).map(|v| v.stock),
            None => Some(self.product.total_stock(&self.variants)),
        }
    }
}

/// Loads products and their variants keyed by product id. Unknown ids are
/// simply absent from the map.
pub async fn load_entries<C: ConnectionTrait>(
    conn: &C,
    product_ids: &[Uuid],
) -> Result<HashMap<Uuid, CatalogEntry>, ServiceError> {
    if product_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let products = product::Entity::find()
        .filter(product::Column::Id.is_in(product_ids.to_vec()))
        .all(conn)
        .await?;

    let variants = product_variant::Entity::find()
        .filter(product_variant::Column::ProductId.is_in(product_ids.to_vec()))
        .order_by_asc(product_variant::Column::CreatedAt)
        .order_by_asc(product_variant::Column::Id)
        .all(conn)
        .await?;

    let mut entries: HashMap<Uuid, CatalogEntry> = products
        .into_iter()
        .map(|p| {
            (
                p.id,
                CatalogEntry {
                    product: p,
                    variants: Vec::new(),
                },
            )
        })
        .collect();

    for variant in variants {
        if let Some(entry) = entries.get_mut(&variant.product_id) {
            entry.variants.push(variant);
        }
    }

    Ok(entries)
}

pub async fn load_entry<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<CatalogEntry, ServiceError> {
    load_entries(conn, &[product_id])
        .await?
        .remove(&product_id)
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
}
