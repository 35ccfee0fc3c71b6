use chrono::Utc;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::address::{self, AddressType},
    errors::ServiceError,
};

/// Raw address fields supplied at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema, PartialEq, Eq)]
pub struct AddressFields {
    #[validate(length(min = 1, message = "Address line 1 is required"))]
    pub line_1: String,
    pub line_2: Option<String>,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    #[validate(length(min = 1, message = "Zip code is required"))]
    pub zip_code: String,
    #[validate(length(min = 1, message = "Country is required"))]
    pub country: String,
}

/// Either a reference to a stored address or inline fields.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(untagged)]
pub enum AddressInput {
    Existing { id: Uuid },
    Inline(AddressFields),
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddressView {
    pub id: Uuid,
    pub address_type: AddressType,
    pub line_1: String,
    pub line_2: Option<String>,
    pub city: String,
    pub zip_code: String,
    pub country: String,
}

impl From<address::Model> for AddressView {
    fn from(m: address::Model) -> Self {
        Self {
            id: m.id,
            address_type: m.address_type,
            line_1: m.line_1,
            line_2: m.line_2,
            city: m.city,
            zip_code: m.zip_code,
            country: m.country,
        }
    }
}

/// Resolves a referenced address or stores a new one.
///
/// A referenced address must exist, and when the caller is signed in it must
/// be theirs or unowned.
pub async fn get_or_create<C: ConnectionTrait>(
    conn: &C,
    input: &AddressInput,
    address_type: AddressType,
    user_id: Option<Uuid>,
) -> Result<address::Model, ServiceError> {
    match input {
        AddressInput::Existing { id } => {
            let found = address::Entity::find_by_id(*id)
                .one(conn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Address {} not found", id)))?;
            if let (Some(owner), Some(caller)) = (found.user_id, user_id) {
                if owner != caller {
                    return Err(ServiceError::Forbidden(
                        "Address belongs to another user".to_string(),
                    ));
                }
            }
            Ok(found)
        }
        AddressInput::Inline(fields) => {
            fields.validate()?;
            let created = address::ActiveModel {
                id: Set(Uuid::new_v4()),
                user_id: Set(user_id),
                address_type: Set(address_type),
                line_1: Set(fields.line_1.trim().to_string()),
                line_2: Set(fields
                    .line_2
                    .as_ref()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())),
                city: Set(fields.city.trim().to_string()),
                zip_code: Set(fields.zip_code.trim().to_string()),
                country: Set(fields.country.trim().to_string()),
                created_at: Set(Utc::now()),
            }
            .insert(conn)
            .await?;
            debug!(address_id = %created.id, ?address_type, "stored address");
            Ok(created)
        }
    }
}

pub async fn find<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> Result<Option<address::Model>, ServiceError> {
    Ok(address::Entity::find_by_id(id).one(conn).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_input_accepts_id_or_fields() {
        let id = Uuid::new_v4();
        let parsed: AddressInput = serde_json::from_value(serde_json::json!({ "id": id })).unwrap();
        assert_eq!(parsed, AddressInput::Existing { id });

        let parsed: AddressInput = serde_json::from_value(serde_json::json!({
            "line_1": "1 Ayala Ave",
            "city": "Makati",
            "zip_code": "1226",
            "country": "PH"
        }))
        .unwrap();
        assert!(matches!(parsed, AddressInput::Inline(ref f) if f.city == "Makati"));
    }

    #[test]
    fn blank_fields_fail_validation() {
        let fields = AddressFields {
            line_1: String::new(),
            line_2: None,
            city: "Makati".into(),
            zip_code: "1226".into(),
            country: "PH".into(),
        };
        assert!(fields.validate().is_err());
    }
}
