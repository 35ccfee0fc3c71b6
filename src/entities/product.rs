use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::product_variant;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    #[sea_orm(unique)]
    pub slug: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub base_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub sale_price: Option<Decimal>,
    /// Stock for products sold without variants
    pub stock: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::product_variant::Entity")]
    Variants,
}

impl Related<super::product_variant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Variants.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Sale price when it is set and positive, else the base price.
    pub fn own_price(&self) -> Decimal {
        match self.sale_price {
            Some(sale) if sale > Decimal::ZERO => sale,
            _ => self.base_price,
        }
    }

    /// Price shown for the product as a whole: the first variant's price when
    /// the product has variants, otherwise its own price.
    ///
    /// `variants` must be in creation order.
    pub fn display_price(&self, variants: &[product_variant::Model]) -> Decimal {
        variants
            .first()
            .map(product_variant::Model::price)
            .unwrap_or_else(|| self.own_price())
    }

    /// Sum of variant stock when variants exist, else the product's own stock.
    pub fn total_stock(&self, variants: &[product_variant::Model]) -> i32 {
        if variants.is_empty() {
            self.stock
        } else {
            variants.iter().map(|v| v.stock).sum()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn product(base: Decimal, sale: Option<Decimal>, stock: i32) -> Model {
        Model {
            id: Uuid::new_v4(),
            name: "Linen Shirt".into(),
            slug: "linen-shirt".into(),
            base_price: base,
            sale_price: sale,
            stock,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn variant(product_id: Uuid, base: Decimal, sale: Option<Decimal>, stock: i32) -> product_variant::Model {
        product_variant::Model {
            id: Uuid::new_v4(),
            product_id,
            name: "M".into(),
            base_price: base,
            sale_price: sale,
            stock,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn own_price_prefers_positive_sale_price() {
        assert_eq!(product(dec!(20), Some(dec!(15)), 0).own_price(), dec!(15));
        assert_eq!(product(dec!(20), Some(dec!(0)), 0).own_price(), dec!(20));
        assert_eq!(product(dec!(20), None, 0).own_price(), dec!(20));
    }

    #[test]
    fn display_price_uses_first_variant() {
        let p = product(dec!(20), Some(dec!(18)), 0);
        let variants = vec![
            variant(p.id, dec!(30), Some(dec!(25)), 1),
            variant(p.id, dec!(12), None, 1),
        ];
        assert_eq!(p.display_price(&variants), dec!(25));
        assert_eq!(p.display_price(&[]), dec!(18));
    }

    #[test]
    fn total_stock_sums_variants_when_present() {
        let p = product(dec!(20), None, 7);
        assert_eq!(p.total_stock(&[]), 7);
        let variants = vec![variant(p.id, dec!(1), None, 2), variant(p.id, dec!(1), None, 3)];
        assert_eq!(p.total_stock(&variants), 5);
    }
}
