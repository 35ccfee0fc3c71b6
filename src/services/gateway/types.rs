//! Wire types for the payment gateway's REST resources.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded gateway resource together with the body it was decoded from.
#[derive(Debug, Clone)]
pub struct GatewayResponse<T> {
    pub resource: T,
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvoiceCustomer {
    pub given_names: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateInvoice {
    pub external_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub invoice_duration: u32,
    pub payment_methods: Vec<String>,
    pub success_redirect_url: String,
    pub failure_redirect_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<InvoiceCustomer>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub invoice_url: Option<String>,
    #[serde(default)]
    pub expiry_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateVirtualAccount {
    pub external_id: String,
    pub bank_code: String,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub expected_amount: Decimal,
    pub currency: String,
    pub is_closed: bool,
    pub is_single_use: bool,
    pub expiration_date: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VirtualAccount {
    pub id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub bank_code: Option<String>,
    #[serde(default)]
    pub account_number: Option<String>,
    pub status: String,
    #[serde(default)]
    pub expiration_date: Option<String>,
}

/// v3 payment request body.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreatePaymentRequest {
    pub reference_id: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub country: String,
    pub currency: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub request_amount: Decimal,
    pub capture_method: String,
    pub channel_code: String,
    pub channel_properties: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PaymentAction {
    #[serde(default, rename = "type")]
    pub action_type: Option<String>,
    #[serde(default)]
    pub descriptor: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PaymentRequest {
    #[serde(alias = "id")]
    pub payment_request_id: String,
    #[serde(default)]
    pub reference_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub latest_payment_id: Option<String>,
    #[serde(default)]
    pub actions: Vec<PaymentAction>,
}

impl PaymentRequest {
    /// URL the customer should be sent to: the first `WEB_URL` action, else
    /// the first `DEEPLINK_URL` action.
    pub fn checkout_url(&self) -> Option<String> {
        let by_descriptor = |descriptor: &str| {
            self.actions
                .iter()
                .find(|a| a.descriptor.as_deref() == Some(descriptor))
                .and_then(|a| a.value.clone())
        };
        by_descriptor("WEB_URL").or_else(|| by_descriptor("DEEPLINK_URL"))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionCustomer {
    #[serde(rename = "type")]
    pub customer_type: String,
    pub reference_id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_number: Option<String>,
    pub individual_detail: IndividualDetail,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndividualDetail {
    pub given_names: String,
    pub surname: String,
}

/// Hosted payment session body, used for card payments without a token.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreatePaymentSession {
    pub reference_id: String,
    pub session_type: String,
    pub mode: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub country: String,
    pub allowed_payment_channels: Vec<String>,
    pub success_return_url: String,
    pub cancel_return_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<SessionCustomer>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PaymentSession {
    #[serde(alias = "id")]
    pub payment_session_id: String,
    #[serde(default)]
    pub reference_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub payment_link_url: Option<String>,
    #[serde(default)]
    pub payment_request_id: Option<String>,
}
