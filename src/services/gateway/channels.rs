//! Maps a caller's chosen payment method onto the gateway's channel codes and
//! per-channel properties.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use utoipa::ToSchema;

use crate::errors::ServiceError;

#[derive(Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct CardDetails {
    pub card_number: String,
    pub expiry_month: String,
    pub expiry_year: String,
    pub cvn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardholder_first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardholder_last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardholder_email: Option<String>,
}

impl std::fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last4 = self
            .card_number
            .get(self.card_number.len().saturating_sub(4)..)
            .unwrap_or("");
        f.debug_struct("CardDetails")
            .field("card_number", &format_args!("****{}", last4))
            .field("expiry_month", &self.expiry_month)
            .field("expiry_year", &self.expiry_year)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EWalletType {
    Gcash,
    Paymaya,
    Grabpay,
    Shopeepay,
}

impl EWalletType {
    pub fn channel_code(self) -> &'static str {
        match self {
            EWalletType::Gcash => "GCASH",
            EWalletType::Paymaya => "PAYMAYA",
            EWalletType::Grabpay => "GRABPAY",
            EWalletType::Shopeepay => "SHOPEEPAY",
        }
    }
}

/// Payment method chosen at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentMethodRequest {
    Card {
        #[serde(default)]
        token_id: Option<String>,
        #[serde(default)]
        card_details: Option<CardDetails>,
        #[serde(default)]
        skip_three_ds: bool,
    },
    #[serde(rename = "ewallet")]
    EWallet {
        wallet: EWalletType,
        #[serde(default)]
        mobile_number: Option<String>,
    },
    BankTransfer {
        bank_code: String,
        #[serde(default)]
        account_name: Option<String>,
    },
}

/// Where the gateway sends the customer after an interactive payment step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnUrls {
    pub success: String,
    pub failure: String,
}

impl ReturnUrls {
    pub fn from_frontend(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            success: format!("{}/payment/success", base),
            failure: format!("{}/payment/failed", base),
        }
    }
}

/// How a payment method is charged.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelPlan {
    /// A v3 payment request on `channel_code`.
    PaymentRequest {
        channel_code: String,
        channel_properties: Value,
    },
    /// A card payment without token or details, collected on the gateway's
    /// hosted page.
    HostedCardSession,
}

impl ChannelPlan {
    /// Value stored as the Payment's method.
    pub fn method_label(&self) -> &str {
        match self {
            ChannelPlan::PaymentRequest { channel_code, .. } => channel_code,
            ChannelPlan::HostedCardSession => CARDS_CHANNEL,
        }
    }
}

pub const CARDS_CHANNEL: &str = "CARDS";

/// Pure mapping from a payment method to the gateway channel and its
/// properties. `display_name` labels bank virtual accounts when the caller
/// gave no account name.
pub fn plan_channel(
    method: &PaymentMethodRequest,
    urls: &ReturnUrls,
    display_name: &str,
) -> Result<ChannelPlan, ServiceError> {
    match method {
        PaymentMethodRequest::Card {
            token_id,
            card_details,
            skip_three_ds,
        } => {
            let token_id = token_id.as_deref().filter(|t| !t.trim().is_empty());
            let (key, value) = match (token_id, card_details) {
                (Some(token), _) => ("card_token_id", json!(token)),
                (None, Some(details)) => ("card_details", serde_json::to_value(details)?),
                (None, None) => return Ok(ChannelPlan::HostedCardSession),
            };

            let mut props = Map::new();
            props.insert(key.into(), value);
            props.insert("skip_three_ds".into(), json!(skip_three_ds));
            props.insert("success_return_url".into(), json!(urls.success));
            props.insert("failure_return_url".into(), json!(urls.failure));

            Ok(ChannelPlan::PaymentRequest {
                channel_code: CARDS_CHANNEL.to_string(),
                channel_properties: Value::Object(props),
            })
        }
        PaymentMethodRequest::EWallet {
            wallet,
            mobile_number,
        } => {
            let mut props = Map::new();
            props.insert("success_return_url".into(), json!(urls.success));
            props.insert("failure_return_url".into(), json!(urls.failure));
            if let Some(mobile) = mobile_number.as_deref().filter(|m| !m.trim().is_empty()) {
                props.insert("mobile_number".into(), json!(mobile));
            }
            Ok(ChannelPlan::PaymentRequest {
                channel_code: wallet.channel_code().to_string(),
                channel_properties: Value::Object(props),
            })
        }
        PaymentMethodRequest::BankTransfer {
            bank_code,
            account_name,
        } => {
            let bank = bank_code.trim().to_ascii_uppercase();
            if bank.is_empty() || !bank.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid bank code '{}'",
                    bank_code
                )));
            }
            let name = account_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or(display_name);
            Ok(ChannelPlan::PaymentRequest {
                channel_code: format!("{}_VIRTUAL_ACCOUNT", bank),
                channel_properties: json!({ "display_name": name }),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    fn urls() -> ReturnUrls {
        ReturnUrls::from_frontend("https://shop.example/")
    }

    #[test]
    fn return_urls_trim_trailing_slash() {
        let urls = urls();
        assert_eq!(urls.success, "https://shop.example/payment/success");
        assert_eq!(urls.failure, "https://shop.example/payment/failed");
    }

    #[rstest]
    #[case(EWalletType::Gcash, "GCASH")]
    #[case(EWalletType::Paymaya, "PAYMAYA")]
    #[case(EWalletType::Grabpay, "GRABPAY")]
    #[case(EWalletType::Shopeepay, "SHOPEEPAY")]
    fn ewallets_map_to_channel_codes(#[case] wallet: EWalletType, #[case] code: &str) {
        let plan = plan_channel(
            &PaymentMethodRequest::EWallet {
                wallet,
                mobile_number: Some("+639171234567".into()),
            },
            &urls(),
            "Juan",
        )
        .unwrap();
        assert_matches!(plan, ChannelPlan::PaymentRequest { channel_code, channel_properties } => {
            assert_eq!(channel_code, code);
            assert_eq!(channel_properties["mobile_number"], "+639171234567");
            assert_eq!(channel_properties["success_return_url"], "https://shop.example/payment/success");
        });
    }

    #[test]
    fn tokenized_card_carries_three_ds_flag() {
        let plan = plan_channel(
            &PaymentMethodRequest::Card {
                token_id: Some("tok_123".into()),
                card_details: None,
                skip_three_ds: true,
            },
            &urls(),
            "Juan",
        )
        .unwrap();
        assert_matches!(plan, ChannelPlan::PaymentRequest { channel_code, channel_properties } => {
            assert_eq!(channel_code, "CARDS");
            assert_eq!(channel_properties["card_token_id"], "tok_123");
            assert_eq!(channel_properties["skip_three_ds"], true);
        });
    }

    #[test]
    fn bare_card_uses_hosted_session() {
        let plan = plan_channel(
            &PaymentMethodRequest::Card {
                token_id: None,
                card_details: None,
                skip_three_ds: false,
            },
            &urls(),
            "Juan",
        )
        .unwrap();
        assert_eq!(plan, ChannelPlan::HostedCardSession);
        assert_eq!(plan.method_label(), "CARDS");
    }

    #[test]
    fn bank_transfer_builds_virtual_account_channel() {
        let plan = plan_channel(
            &PaymentMethodRequest::BankTransfer {
                bank_code: "bpi".into(),
                account_name: None,
            },
            &urls(),
            "Juan Dela Cruz",
        )
        .unwrap();
        assert_matches!(plan, ChannelPlan::PaymentRequest { channel_code, channel_properties } => {
            assert_eq!(channel_code, "BPI_VIRTUAL_ACCOUNT");
            assert_eq!(channel_properties["display_name"], "Juan Dela Cruz");
        });

        assert_matches!(
            plan_channel(
                &PaymentMethodRequest::BankTransfer { bank_code: " ".into(), account_name: None },
                &urls(),
                "x"
            ),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn payment_method_json_is_tagged() {
        let method: PaymentMethodRequest = serde_json::from_value(serde_json::json!({
            "type": "ewallet",
            "wallet": "gcash"
        }))
        .unwrap();
        assert_eq!(
            method,
            PaymentMethodRequest::EWallet { wallet: EWalletType::Gcash, mobile_number: None }
        );
    }

    #[test]
    fn card_debug_masks_number() {
        let details = CardDetails {
            card_number: "4000000000001091".into(),
            expiry_month: "12".into(),
            expiry_year: "2030".into(),
            cvn: "123".into(),
            cardholder_first_name: None,
            cardholder_last_name: None,
            cardholder_email: None,
        };
        let rendered = format!("{:?}", details);
        assert!(rendered.contains("****1091"));
        assert!(!rendered.contains("4000000000001091"));
        assert!(!rendered.contains("123\""));
    }
}
