//! Payment creation against the gateway and reconciliation of gateway state
//! (webhooks and polled checks) into local Payment and Order rows.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    config::AppConfig,
    db::supports_row_locks,
    entities::{
        order::{self, OrderStatus},
        payment::{self, PaymentStatus},
        user,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::gateway::{
        plan_channel, ChannelPlan, CreateInvoice, CreatePaymentRequest, CreatePaymentSession,
        CreateVirtualAccount, GatewayClient, IndividualDetail, InvoiceCustomer,
        PaymentMethodRequest, ReturnUrls, SessionCustomer,
    },
    PaginatedResponse,
};

/// Payment method recorded for hosted invoices.
pub const INVOICE_METHOD: &str = "xendit_invoice";
/// Prefix of the payment method recorded for virtual accounts.
pub const VIRTUAL_ACCOUNT_PREFIX: &str = "virtual_account_";

const DEFAULT_INVOICE_METHODS: [&str; 3] = ["BANK_TRANSFER", "CREDIT_CARD", "EWALLET"];
const INVOICE_DURATION_SECS: u32 = 86_400;
const DEFAULT_BANK_CODE: &str = "BCA";
const GUEST_OWNER: &str = "guest";
const GUEST_NAME: &str = "Guest";

/// Maps a gateway status string onto the local payment status.
///
/// Matching is case-insensitive. Unknown statuses stay `pending` so a new
/// gateway status never reads as a failure.
pub fn map_gateway_status(status: &str, cancelled: PaymentStatus) -> PaymentStatus {
    match status.trim().to_ascii_uppercase().as_str() {
        "SUCCEEDED" | "PAID" | "COMPLETED" => PaymentStatus::Paid,
        "FAILED" => PaymentStatus::Failed,
        "EXPIRED" => PaymentStatus::Expired,
        "CANCELLED" | "CANCELED" => cancelled,
        "REQUIRES_ACTION" | "PENDING" | "ACTIVE" => PaymentStatus::Pending,
        other => {
            debug!(status = other, "unrecognized gateway status");
            PaymentStatus::Pending
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// Checks the `x-callback-token` header against the configured secret.
pub fn verify_callback_token(provided: Option<&str>, expected: &str) -> Result<(), ServiceError> {
    match provided {
        Some(token) if !expected.is_empty() && constant_time_eq(token, expected) => Ok(()),
        _ => Err(ServiceError::WebhookAuth),
    }
}

/// Which gateway notification shape a webhook arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    PaymentSession,
    Payment,
    PaymentRequest,
    /// Flat invoice or virtual-account callback without an `event` field
    Legacy,
}

/// Identifiers and status extracted from a webhook body.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookUpdate {
    pub family: EventFamily,
    pub status: String,
    pub transaction_id: Option<String>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub reference_id: Option<String>,
}

fn str_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Normalizes the gateway's webhook shapes into one update.
///
/// Non-object bodies, missing `data` or missing `status` are malformed (400);
/// an `event` outside the known families is unsupported (422).
pub fn parse_webhook(payload: &Value) -> Result<WebhookUpdate, ServiceError> {
    let object = payload
        .as_object()
        .ok_or_else(|| ServiceError::BadRequest("Webhook payload must be a JSON object".into()))?;

    let event = match object.get("event") {
        None | Some(Value::Null) => None,
        Some(Value::String(event)) => Some(event.as_str()),
        Some(_) => {
            return Err(ServiceError::BadRequest(
                "Webhook event must be a string".into(),
            ))
        }
    };

    let Some(event) = event else {
        let status = str_field(object, "status")
            .ok_or_else(|| ServiceError::BadRequest("Webhook payload has no status".into()))?;
        return Ok(WebhookUpdate {
            family: EventFamily::Legacy,
            status,
            transaction_id: str_field(object, "id"),
            request_id: None,
            session_id: None,
            reference_id: str_field(object, "external_id"),
        });
    };

    let family = if event.starts_with("payment_session.") {
        EventFamily::PaymentSession
    } else if event.starts_with("payment_request.") {
        EventFamily::PaymentRequest
    } else if event.starts_with("payment.") {
        EventFamily::Payment
    } else {
        return Err(ServiceError::UnsupportedEvent(event.to_string()));
    };

    let data = object
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| ServiceError::BadRequest(format!("Webhook {} has no data", event)))?;
    let mut update = WebhookUpdate {
        family,
        status: str_field(data, "status")
            .ok_or_else(|| ServiceError::BadRequest("Webhook payload has no status".into()))?,
        transaction_id: None,
        request_id: str_field(data, "payment_request_id"),
        session_id: None,
        reference_id: str_field(data, "reference_id"),
    };
    match family {
        EventFamily::PaymentSession => {
            update.session_id = str_field(data, "payment_session_id");
        }
        EventFamily::Payment => {
            update.transaction_id = str_field(data, "payment_id");
        }
        EventFamily::PaymentRequest => {
            update.request_id = update.request_id.take().or_else(|| str_field(data, "id"));
        }
        EventFamily::Legacy => {}
    }
    Ok(update)
}

/// Gateway state observed for one payment, from a webhook or a poll.
#[derive(Debug, Clone)]
struct Observation {
    status: PaymentStatus,
    transaction_id: Option<String>,
    request_id: Option<String>,
    session_id: Option<String>,
    raw: Value,
    raw_is_session: bool,
}

struct Reconciled {
    payment: payment::Model,
    changed: bool,
    events: Vec<Event>,
}

fn backfill(
    slot: &mut sea_orm::ActiveValue<Option<String>>,
    current: &Option<String>,
    observed: Option<String>,
    changed: &mut bool,
) {
    if current.is_none() {
        if let Some(value) = observed {
            *slot = Set(Some(value));
            *changed = true;
        }
    }
}

/// Applies an observation to a locked payment row.
///
/// `paid` is sticky: a later non-success status never downgrades it. Only
/// differing fields are written, so replaying an observation is a no-op.
async fn apply_observation<C: ConnectionTrait>(
    conn: &C,
    payment: payment::Model,
    observation: Observation,
) -> Result<Reconciled, ServiceError> {
    let old_status = payment.status;
    let new_status = if old_status == PaymentStatus::Paid {
        if observation.status != PaymentStatus::Paid {
            warn!(
                payment_id = %payment.id,
                observed = %observation.status,
                "ignoring status regression on paid payment"
            );
        }
        PaymentStatus::Paid
    } else {
        observation.status
    };

    let mut active: payment::ActiveModel = payment.clone().into();
    let mut changed = false;

    if new_status != old_status {
        active.status = Set(new_status);
        changed = true;
    }
    if new_status == PaymentStatus::Paid && payment.payment_date.is_none() {
        active.payment_date = Set(Some(Utc::now()));
        changed = true;
    }
    backfill(
        &mut active.gateway_transaction_id,
        &payment.gateway_transaction_id,
        observation.transaction_id,
        &mut changed,
    );
    backfill(
        &mut active.payment_request_id,
        &payment.payment_request_id,
        observation.request_id,
        &mut changed,
    );
    backfill(
        &mut active.gateway_session_id,
        &payment.gateway_session_id,
        observation.session_id,
        &mut changed,
    );

    let updated = if changed {
        if observation.raw_is_session {
            active.session_data = Set(Some(observation.raw));
        } else {
            active.payment_details = Set(Some(observation.raw));
        }
        active.update(conn).await?
    } else {
        payment
    };

    let mut events = Vec::new();
    if new_status != old_status {
        info!(payment_id = %updated.id, %old_status, %new_status, "payment status changed");
        events.push(Event::PaymentStatusChanged {
            payment_id: updated.id,
            old_status,
            new_status,
        });
    }
    if new_status == PaymentStatus::Paid {
        if let Some(event) = advance_order(conn, updated.id).await? {
            events.push(event);
        }
    }

    Ok(Reconciled {
        payment: updated,
        changed,
        events,
    })
}

/// Moves the order paid by `payment_id` into `processing` when it is still
/// waiting for payment.
async fn advance_order<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
) -> Result<Option<Event>, ServiceError> {
    let mut query = order::Entity::find().filter(order::Column::PaymentId.eq(payment_id));
    if supports_row_locks(conn) {
        query = query.lock_exclusive();
    }
    let Some(order) = query.one(conn).await? else {
        return Ok(None);
    };
    if !order.status.awaits_payment() {
        return Ok(None);
    }

    let order_id = order.id;
    let old_status = order.status;
    let mut active: order::ActiveModel = order.into();
    active.status = Set(OrderStatus::Processing);
    active.update(conn).await?;

    info!(%order_id, %old_status, "payment confirmed, order processing");
    Ok(Some(Event::OrderStatusChanged {
        order_id,
        old_status,
        new_status: OrderStatus::Processing,
    }))
}

async fn find_locked<C, V>(
    conn: &C,
    column: payment::Column,
    value: V,
) -> Result<Option<payment::Model>, ServiceError>
where
    C: ConnectionTrait,
    V: Into<sea_orm::Value>,
{
    let mut query = payment::Entity::find().filter(column.eq(value));
    if supports_row_locks(conn) {
        query = query.lock_exclusive();
    }
    Ok(query.one(conn).await?)
}

/// First payment matching transaction id, request id, session id, then
/// reference id.
async fn find_webhook_target<C: ConnectionTrait>(
    conn: &C,
    update: &WebhookUpdate,
) -> Result<Option<payment::Model>, ServiceError> {
    let candidates = [
        (
            payment::Column::GatewayTransactionId,
            update.transaction_id.as_deref(),
        ),
        (payment::Column::PaymentRequestId, update.request_id.as_deref()),
        (payment::Column::GatewaySessionId, update.session_id.as_deref()),
        (payment::Column::ReferenceId, update.reference_id.as_deref()),
    ];
    for (column, value) in candidates {
        if let Some(value) = value {
            if let Some(found) = find_locked(conn, column, value).await? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

/// Contact details forwarded to the gateway with a charge.
#[derive(Debug, Clone)]
pub struct ChargeCustomer {
    pub reference: String,
    pub email: String,
    pub given_names: String,
    pub surname: String,
    pub mobile_number: Option<String>,
}

impl ChargeCustomer {
    fn display_name(&self) -> String {
        format!("{} {}", self.given_names, self.surname)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ChargeRequest<'a> {
    pub reference_id: String,
    pub user_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub country: String,
    pub description: Option<String>,
    pub method: &'a PaymentMethodRequest,
    pub customer: Option<ChargeCustomer>,
}

/// Where to send the customer to complete a charge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChargeLinks {
    pub checkout_url: Option<String>,
    pub payment_session_id: Option<String>,
}

struct NewPayment {
    user_id: Option<Uuid>,
    amount: Decimal,
    currency: String,
    status: PaymentStatus,
    payment_method: String,
    reference_id: String,
    gateway_transaction_id: Option<String>,
    payment_request_id: Option<String>,
    gateway_session_id: Option<String>,
    session_data: Option<Value>,
    payment_details: Option<Value>,
}

async fn insert_payment<C: ConnectionTrait>(
    conn: &C,
    new: NewPayment,
) -> Result<payment::Model, ServiceError> {
    let now = Utc::now();
    let payment_date = (new.status == PaymentStatus::Paid).then_some(now);
    let model = payment::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(new.user_id),
        amount: Set(new.amount),
        currency: Set(new.currency),
        status: Set(new.status),
        payment_method: Set(new.payment_method),
        payment_date: Set(payment_date),
        reference_id: Set(new.reference_id),
        gateway_transaction_id: Set(new.gateway_transaction_id),
        payment_request_id: Set(new.payment_request_id),
        gateway_session_id: Set(new.gateway_session_id),
        session_data: Set(new.session_data),
        payment_details: Set(new.payment_details),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;
    debug!(payment_id = %model.id, reference_id = %model.reference_id, "payment stored");
    Ok(model)
}

/// Charges `request.amount` through the channel chosen by `request.method`
/// and stores the resulting Payment on `conn`.
///
/// Runs inside the caller's transaction during checkout, so a gateway error
/// leaves nothing behind once the caller rolls back.
#[instrument(skip(conn, gateway, urls, request), fields(reference_id = %request.reference_id, amount = %request.amount))]
pub async fn initiate_charge<C: ConnectionTrait>(
    conn: &C,
    gateway: &GatewayClient,
    urls: &ReturnUrls,
    cancelled_status: PaymentStatus,
    request: ChargeRequest<'_>,
) -> Result<(payment::Model, ChargeLinks), ServiceError> {
    let display_name = request
        .customer
        .as_ref()
        .map(ChargeCustomer::display_name)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| GUEST_NAME.to_string());
    let plan = plan_channel(request.method, urls, &display_name)?;
    let method_label = plan.method_label().to_string();

    match plan {
        ChannelPlan::PaymentRequest {
            channel_code,
            channel_properties,
        } => {
            let body = CreatePaymentRequest {
                reference_id: request.reference_id.clone(),
                request_type: "PAY".to_string(),
                country: request.country,
                currency: request.currency.clone(),
                request_amount: request.amount,
                capture_method: "AUTOMATIC".to_string(),
                channel_code,
                channel_properties,
                description: request.description,
            };
            let response = gateway.create_payment_request(&body).await?;
            let created = response.resource;
            let links = ChargeLinks {
                checkout_url: created.checkout_url(),
                payment_session_id: None,
            };

            let payment = insert_payment(
                conn,
                NewPayment {
                    user_id: request.user_id,
                    amount: request.amount,
                    currency: request.currency,
                    status: map_gateway_status(&created.status, cancelled_status),
                    payment_method: method_label,
                    reference_id: request.reference_id,
                    gateway_transaction_id: created.latest_payment_id,
                    payment_request_id: Some(created.payment_request_id),
                    gateway_session_id: None,
                    session_data: None,
                    payment_details: Some(response.raw),
                },
            )
            .await?;
            Ok((payment, links))
        }
        ChannelPlan::HostedCardSession => {
            let body = CreatePaymentSession {
                reference_id: request.reference_id.clone(),
                session_type: "PAY".to_string(),
                mode: "PAYMENT_LINK".to_string(),
                amount: request.amount,
                currency: request.currency.clone(),
                country: request.country,
                allowed_payment_channels: vec![method_label.clone()],
                success_return_url: urls.success.clone(),
                cancel_return_url: urls.failure.clone(),
                description: request.description,
                customer: request.customer.map(|c| SessionCustomer {
                    customer_type: "INDIVIDUAL".to_string(),
                    reference_id: c.reference,
                    email: c.email,
                    mobile_number: c.mobile_number,
                    individual_detail: IndividualDetail {
                        given_names: c.given_names,
                        surname: c.surname,
                    },
                }),
            };
            let response = gateway.create_payment_session(&body).await?;
            let session = response.resource;
            let links = ChargeLinks {
                checkout_url: session.payment_link_url.clone(),
                payment_session_id: Some(session.payment_session_id.clone()),
            };

            let payment = insert_payment(
                conn,
                NewPayment {
                    user_id: request.user_id,
                    amount: request.amount,
                    currency: request.currency,
                    status: map_gateway_status(&session.status, cancelled_status),
                    payment_method: method_label,
                    reference_id: request.reference_id,
                    gateway_transaction_id: None,
                    payment_request_id: session.payment_request_id,
                    gateway_session_id: Some(session.payment_session_id),
                    session_data: Some(response.raw),
                    payment_details: None,
                },
            )
            .await?;
            Ok((payment, links))
        }
    }
}

/// Payment as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentView {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: String,
    pub payment_date: Option<chrono::DateTime<Utc>>,
    pub reference_id: String,
    pub gateway_transaction_id: Option<String>,
    pub payment_request_id: Option<String>,
    pub gateway_session_id: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub payment_details: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub session_data: Option<Value>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<payment::Model> for PaymentView {
    fn from(m: payment::Model) -> Self {
        Self {
            id: m.id,
            user_id: m.user_id,
            amount: m.amount,
            currency: m.currency,
            status: m.status,
            payment_method: m.payment_method,
            payment_date: m.payment_date,
            reference_id: m.reference_id,
            gateway_transaction_id: m.gateway_transaction_id,
            payment_request_id: m.payment_request_id,
            gateway_session_id: m.gateway_session_id,
            payment_details: m.payment_details,
            session_data: m.session_data,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateInvoiceRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payment_methods: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateVirtualAccountRequest {
    pub amount: Decimal,
    #[serde(default = "default_bank_code")]
    pub bank_code: String,
    #[serde(default)]
    pub currency: Option<String>,
}

fn default_bank_code() -> String {
    DEFAULT_BANK_CODE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreatePaymentRequestBody {
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub payment_method: PaymentMethodRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoiceCreated {
    pub payment: PaymentView,
    pub invoice_url: Option<String>,
    pub expiry_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VirtualAccountCreated {
    pub payment: PaymentView,
    pub bank_code: String,
    pub account_number: Option<String>,
    pub expiration_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentRequestCreated {
    pub payment: PaymentView,
    #[serde(flatten)]
    pub links: ChargeLinks,
}

/// Result of processing one webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WebhookOutcome {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    pub family: EventFamily,
    /// False when the delivery repeated state already recorded
    pub changed: bool,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct PaymentListQuery {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub per_page: Option<u64>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub payment_method: Option<String>,
}

const DEFAULT_PER_PAGE: u64 = 10;
const ADMIN_PER_PAGE: u64 = 20;

fn validate_amount(amount: Decimal) -> Result<(), ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Amount must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Payment creation, queries and reconciliation.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<GatewayClient>,
    config: Arc<AppConfig>,
    event_sender: Arc<EventSender>,
}

impl PaymentService {
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

    fn return_urls(&self) -> ReturnUrls {
        ReturnUrls::from_frontend(self.config.frontend_base())
    }

    fn currency(&self, requested: Option<&str>) -> Result<String, ServiceError> {
        let currency = requested
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.config.default_currency)
            .to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ServiceError::ValidationError(format!(
                "Invalid currency '{}'",
                currency
            )));
        }
        Ok(currency)
    }

    async fn load_user(&self, user_id: Option<Uuid>) -> Result<Option<user::Model>, ServiceError> {
        match user_id {
            Some(id) => Ok(user::Entity::find_by_id(id).one(&*self.db).await?),
            None => Ok(None),
        }
    }

    async fn emit(&self, events: Vec<Event>) {
        for event in events {
            self.event_sender.send_or_log(event).await;
        }
    }

    /// Creates a hosted invoice covering every configured payment method.
    #[instrument(skip(self, request), fields(amount = %request.amount))]
    pub async fn create_invoice(
        &self,
        user_id: Option<Uuid>,
        request: CreateInvoiceRequest,
    ) -> Result<InvoiceCreated, ServiceError> {
        validate_amount(request.amount)?;
        let currency = self.currency(request.currency.as_deref())?;
        let owner = owner_label(user_id);
        let reference_id = format!("invoice_{}_{}", owner, Utc::now().timestamp());
        let urls = self.return_urls();
        let profile = self.load_user(user_id).await?;

        let body = CreateInvoice {
            external_id: reference_id.clone(),
            amount: request.amount,
            currency: currency.clone(),
            description: request
                .description
                .unwrap_or_else(|| format!("Payment {}", reference_id)),
            invoice_duration: INVOICE_DURATION_SECS,
            payment_methods: request.payment_methods.unwrap_or_else(|| {
                DEFAULT_INVOICE_METHODS
                    .iter()
                    .map(|m| m.to_string())
                    .collect()
            }),
            success_redirect_url: urls.success,
            failure_redirect_url: urls.failure,
            customer: profile.as_ref().map(|u| InvoiceCustomer {
                given_names: u.full_name(),
                email: Some(u.email.clone()),
            }),
        };

        let response = self.gateway.create_invoice(&body).await?;
        let invoice = response.resource;
        let payment = insert_payment(
            &*self.db,
            NewPayment {
                user_id,
                amount: request.amount,
                currency,
                status: map_gateway_status(&invoice.status, self.config.gateway.cancelled_status),
                payment_method: INVOICE_METHOD.to_string(),
                reference_id,
                gateway_transaction_id: Some(invoice.id.clone()),
                payment_request_id: None,
                gateway_session_id: None,
                session_data: None,
                payment_details: Some(response.raw),
            },
        )
        .await?;

        info!(payment_id = %payment.id, invoice_id = %invoice.id, "invoice created");
        self.event_sender
            .send_or_log(Event::PaymentCreated {
                payment_id: payment.id,
                reference_id: payment.reference_id.clone(),
                payment_method: payment.payment_method.clone(),
            })
            .await;

        Ok(InvoiceCreated {
            payment: payment.into(),
            invoice_url: invoice.invoice_url,
            expiry_date: invoice.expiry_date,
        })
    }

    /// Creates a closed, fixed-amount virtual account that expires in 24 hours.
    #[instrument(skip(self, request), fields(amount = %request.amount, bank = %request.bank_code))]
    pub async fn create_virtual_account(
        &self,
        user_id: Option<Uuid>,
        request: CreateVirtualAccountRequest,
    ) -> Result<VirtualAccountCreated, ServiceError> {
        validate_amount(request.amount)?;
        let currency = self.currency(request.currency.as_deref())?;
        let bank = request.bank_code.trim().to_ascii_uppercase();
        if bank.is_empty() {
            return Err(ServiceError::ValidationError(
                "Bank code is required".to_string(),
            ));
        }
        let owner = owner_label(user_id);
        let reference_id = format!("{}{}_{}", VIRTUAL_ACCOUNT_PREFIX, owner, Utc::now().timestamp());
        let name = self
            .load_user(user_id)
            .await?
            .map(|u| u.full_name())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| GUEST_NAME.to_string());

        let body = CreateVirtualAccount {
            external_id: reference_id.clone(),
            bank_code: bank.clone(),
            name,
            expected_amount: request.amount,
            currency: currency.clone(),
            is_closed: true,
            is_single_use: true,
            expiration_date: (Utc::now() + Duration::hours(24)).to_rfc3339(),
        };

        let response = self.gateway.create_virtual_account(&body).await?;
        let account = response.resource;
        let payment = insert_payment(
            &*self.db,
            NewPayment {
                user_id,
                amount: request.amount,
                currency,
                status: map_gateway_status(&account.status, self.config.gateway.cancelled_status),
                payment_method: format!("{}{}", VIRTUAL_ACCOUNT_PREFIX, bank),
                reference_id,
                gateway_transaction_id: Some(account.id.clone()),
                payment_request_id: None,
                gateway_session_id: None,
                session_data: None,
                payment_details: Some(response.raw),
            },
        )
        .await?;

        info!(payment_id = %payment.id, account_id = %account.id, "virtual account created");
        self.event_sender
            .send_or_log(Event::PaymentCreated {
                payment_id: payment.id,
                reference_id: payment.reference_id.clone(),
                payment_method: payment.payment_method.clone(),
            })
            .await;

        Ok(VirtualAccountCreated {
            payment: payment.into(),
            bank_code: bank,
            account_number: account.account_number,
            expiration_date: account.expiration_date,
        })
    }

    /// Creates a standalone payment request (or hosted card session).
    #[instrument(skip(self, request), fields(amount = %request.amount))]
    pub async fn create_payment_request(
        &self,
        user_id: Option<Uuid>,
        request: CreatePaymentRequestBody,
    ) -> Result<PaymentRequestCreated, ServiceError> {
        validate_amount(request.amount)?;
        let currency = self.currency(request.currency.as_deref())?;
        let reference_id = format!("pr_{}", Uuid::new_v4());
        let customer = self.load_user(user_id).await?.map(|u| ChargeCustomer {
            reference: format!("customer_{}", u.id),
            email: u.email,
            given_names: u.first_name,
            surname: u.last_name,
            mobile_number: u.phone_number,
        });

        let (payment, links) = initiate_charge(
            &*self.db,
            &self.gateway,
            &self.return_urls(),
            self.config.gateway.cancelled_status,
            ChargeRequest {
                reference_id,
                user_id,
                amount: request.amount,
                currency,
                country: self.config.default_country.clone(),
                description: request.description,
                method: &request.payment_method,
                customer,
            },
        )
        .await?;

        self.event_sender
            .send_or_log(Event::PaymentCreated {
                payment_id: payment.id,
                reference_id: payment.reference_id.clone(),
                payment_method: payment.payment_method.clone(),
            })
            .await;

        Ok(PaymentRequestCreated {
            payment: payment.into(),
            links,
        })
    }

    /// Applies a gateway notification.
    ///
    /// The callback token is checked before the body is looked at. Replayed
    /// deliveries leave state untouched and emit no events.
    #[instrument(skip(self, token, payload))]
    pub async fn handle_webhook(
        &self,
        token: Option<&str>,
        payload: &Value,
    ) -> Result<WebhookOutcome, ServiceError> {
        verify_callback_token(token, &self.config.gateway.webhook_token).map_err(|e| {
            warn!("webhook rejected: bad callback token");
            e
        })?;

        let update = parse_webhook(payload)?;
        let status = map_gateway_status(&update.status, self.config.gateway.cancelled_status);
        debug!(family = ?update.family, gateway_status = %update.status, %status, "webhook parsed");

        let txn = self.db.begin().await?;
        let payment = find_webhook_target(&txn, &update).await?.ok_or_else(|| {
            warn!(
                transaction_id = ?update.transaction_id,
                request_id = ?update.request_id,
                session_id = ?update.session_id,
                reference_id = ?update.reference_id,
                "webhook matched no payment"
            );
            ServiceError::NotFound("Payment not found".to_string())
        })?;

        let reconciled = apply_observation(
            &txn,
            payment,
            Observation {
                status,
                transaction_id: update.transaction_id.clone(),
                request_id: update.request_id.clone(),
                session_id: update.session_id.clone(),
                raw: payload.clone(),
                raw_is_session: update.family == EventFamily::PaymentSession,
            },
        )
        .await?;
        txn.commit().await?;

        let outcome = WebhookOutcome {
            payment_id: reconciled.payment.id,
            status: reconciled.payment.status,
            family: update.family,
            changed: reconciled.changed,
        };
        self.emit(reconciled.events).await;
        Ok(outcome)
    }

    /// Polls the gateway for the payment's current state and records it.
    ///
    /// Uses the request id when present, then the session id, then the
    /// invoice or virtual-account id. A payment with none of these is
    /// returned unchanged.
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn check_status(
        &self,
        caller: &AuthUser,
        payment_id: Uuid,
    ) -> Result<PaymentView, ServiceError> {
        let payment = self.find_accessible(caller, payment_id).await?;
        let cancelled = self.config.gateway.cancelled_status;

        let observation = if let Some(request_id) = payment.payment_request_id.as_deref() {
            let response = self.gateway.get_payment_request(request_id).await?;
            Observation {
                status: map_gateway_status(&response.resource.status, cancelled),
                transaction_id: response.resource.latest_payment_id,
                request_id: None,
                session_id: None,
                raw: response.raw,
                raw_is_session: false,
            }
        } else if let Some(session_id) = payment.gateway_session_id.as_deref() {
            let response = self.gateway.get_payment_session(session_id).await?;
            Observation {
                status: map_gateway_status(&response.resource.status, cancelled),
                transaction_id: None,
                request_id: response.resource.payment_request_id,
                session_id: None,
                raw: response.raw,
                raw_is_session: true,
            }
        } else if let Some(transaction_id) = payment.gateway_transaction_id.as_deref() {
            if payment.payment_method == INVOICE_METHOD {
                let response = self.gateway.get_invoice(transaction_id).await?;
                Observation {
                    status: map_gateway_status(&response.resource.status, cancelled),
                    transaction_id: None,
                    request_id: None,
                    session_id: None,
                    raw: response.raw,
                    raw_is_session: false,
                }
            } else if payment.payment_method.starts_with(VIRTUAL_ACCOUNT_PREFIX) {
                let response = self.gateway.get_virtual_account(transaction_id).await?;
                Observation {
                    status: map_gateway_status(&response.resource.status, cancelled),
                    transaction_id: None,
                    request_id: None,
                    session_id: None,
                    raw: response.raw,
                    raw_is_session: false,
                }
            } else {
                debug!(payment_id = %payment.id, "no pollable gateway resource");
                return Ok(payment.into());
            }
        } else {
            debug!(payment_id = %payment.id, "payment has no gateway identifiers");
            return Ok(payment.into());
        };

        let txn = self.db.begin().await?;
        let locked = find_locked(&txn, payment::Column::Id, payment.id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;
        let reconciled = apply_observation(&txn, locked, observation).await?;
        txn.commit().await?;

        self.emit(reconciled.events).await;
        Ok(reconciled.payment.into())
    }

    async fn find_accessible(
        &self,
        caller: &AuthUser,
        payment_id: Uuid,
    ) -> Result<payment::Model, ServiceError> {
        let payment = payment::Entity::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;
        if !caller.can_access(payment.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this payment".to_string(),
            ));
        }
        Ok(payment)
    }

    #[instrument(skip(self, caller))]
    pub async fn get(&self, caller: &AuthUser, payment_id: Uuid) -> Result<PaymentView, ServiceError> {
        Ok(self.find_accessible(caller, payment_id).await?.into())
    }

    #[instrument(skip(self))]
    pub async fn my_payments(
        &self,
        user_id: Uuid,
        query: PaymentListQuery,
    ) -> Result<PaginatedResponse<PaymentView>, ServiceError> {
        self.list(
            PaymentListQuery {
                user_id: Some(user_id),
                ..query
            },
            DEFAULT_PER_PAGE,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn list_admin(
        &self,
        query: PaymentListQuery,
    ) -> Result<PaginatedResponse<PaymentView>, ServiceError> {
        self.list(query, ADMIN_PER_PAGE).await
    }

    async fn list(
        &self,
        query: PaymentListQuery,
        default_per_page: u64,
    ) -> Result<PaginatedResponse<PaymentView>, ServiceError> {
        let page = query.page.unwrap_or(1).max(1);
        let per_page = query.per_page.unwrap_or(default_per_page).clamp(1, 100);

        let mut select = payment::Entity::find();
        if let Some(user_id) = query.user_id {
            select = select.filter(payment::Column::UserId.eq(user_id));
        }
        if let Some(status) = query.status {
            select = select.filter(payment::Column::Status.eq(status));
        }
        if let Some(method) = query.payment_method.as_deref().filter(|m| !m.is_empty()) {
            select = select.filter(payment::Column::PaymentMethod.eq(method));
        }

        let paginator = select
            .order_by_desc(payment::Column::CreatedAt)
            .order_by_desc(payment::Column::Id)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let items = paginator
            .fetch_page(page - 1)
            .await?
            .into_iter()
            .map(PaymentView::from)
            .collect();

        Ok(PaginatedResponse::new(items, total, page, per_page))
    }
}

fn owner_label(user_id: Option<Uuid>) -> String {
    user_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| GUEST_OWNER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("REQUIRES_ACTION", PaymentStatus::Pending)]
    #[case("PENDING", PaymentStatus::Pending)]
    #[case("ACTIVE", PaymentStatus::Pending)]
    #[case("SUCCEEDED", PaymentStatus::Paid)]
    #[case("succeeded", PaymentStatus::Paid)]
    #[case("PAID", PaymentStatus::Paid)]
    #[case("COMPLETED", PaymentStatus::Paid)]
    #[case("FAILED", PaymentStatus::Failed)]
    #[case("EXPIRED", PaymentStatus::Expired)]
    #[case("CANCELLED", PaymentStatus::Cancelled)]
    #[case("CANCELED", PaymentStatus::Cancelled)]
    #[case("AWAITING_CAPTURE", PaymentStatus::Pending)]
    #[case("", PaymentStatus::Pending)]
    fn gateway_status_mapping(#[case] gateway: &str, #[case] expected: PaymentStatus) {
        assert_eq!(map_gateway_status(gateway, PaymentStatus::Cancelled), expected);
    }

    #[test]
    fn cancellation_mapping_is_configurable() {
        assert_eq!(
            map_gateway_status("CANCELLED", PaymentStatus::Failed),
            PaymentStatus::Failed
        );
    }

    #[test]
    fn callback_token_comparison() {
        assert!(verify_callback_token(Some("secret-token"), "secret-token").is_ok());
        assert_matches!(
            verify_callback_token(Some("secret-tokeN"), "secret-token"),
            Err(ServiceError::WebhookAuth)
        );
        assert_matches!(
            verify_callback_token(None, "secret-token"),
            Err(ServiceError::WebhookAuth)
        );
        assert_matches!(verify_callback_token(Some(""), ""), Err(ServiceError::WebhookAuth));
    }

    #[test]
    fn parses_session_event() {
        let update = parse_webhook(&json!({
            "event": "payment_session.completed",
            "data": {
                "payment_session_id": "ps-1",
                "reference_id": "order_1",
                "status": "COMPLETED",
                "payment_request_id": "pr-1"
            }
        }))
        .unwrap();
        assert_eq!(update.family, EventFamily::PaymentSession);
        assert_eq!(update.session_id.as_deref(), Some("ps-1"));
        assert_eq!(update.request_id.as_deref(), Some("pr-1"));
        assert_eq!(update.reference_id.as_deref(), Some("order_1"));
        assert_eq!(update.transaction_id, None);
    }

    #[test]
    fn parses_payment_event() {
        let update = parse_webhook(&json!({
            "event": "payment.capture",
            "data": {
                "payment_id": "py-1",
                "payment_request_id": "pr-1",
                "status": "SUCCEEDED"
            }
        }))
        .unwrap();
        assert_eq!(update.family, EventFamily::Payment);
        assert_eq!(update.transaction_id.as_deref(), Some("py-1"));
        assert_eq!(update.request_id.as_deref(), Some("pr-1"));
        assert_eq!(update.status, "SUCCEEDED");
    }

    #[test]
    fn payment_request_event_falls_back_to_id() {
        let update = parse_webhook(&json!({
            "event": "payment_request.expiry",
            "data": { "id": "pr-9", "status": "EXPIRED" }
        }))
        .unwrap();
        assert_eq!(update.family, EventFamily::PaymentRequest);
        assert_eq!(update.request_id.as_deref(), Some("pr-9"));
    }

    #[test]
    fn parses_legacy_invoice_callback() {
        let update = parse_webhook(&json!({
            "id": "inv-1",
            "external_id": "invoice_guest_1700000000",
            "status": "PAID"
        }))
        .unwrap();
        assert_eq!(update.family, EventFamily::Legacy);
        assert_eq!(update.transaction_id.as_deref(), Some("inv-1"));
        assert_eq!(update.reference_id.as_deref(), Some("invoice_guest_1700000000"));
    }

    #[test]
    fn malformed_payloads_are_bad_requests() {
        assert_matches!(parse_webhook(&json!([1, 2])), Err(ServiceError::BadRequest(_)));
        assert_matches!(
            parse_webhook(&json!({ "id": "inv-1" })),
            Err(ServiceError::BadRequest(_))
        );
        assert_matches!(
            parse_webhook(&json!({ "event": "payment.capture" })),
            Err(ServiceError::BadRequest(_))
        );
        assert_matches!(
            parse_webhook(&json!({ "event": "payment.capture", "data": { "payment_id": "py-1" } })),
            Err(ServiceError::BadRequest(_))
        );
    }

    #[test]
    fn unknown_event_family_is_unsupported() {
        assert_matches!(
            parse_webhook(&json!({ "event": "refund.succeeded", "data": { "status": "SUCCEEDED" } })),
            Err(ServiceError::UnsupportedEvent(event)) if event == "refund.succeeded"
        );
    }

    #[test]
    fn amounts_must_be_positive() {
        assert!(validate_amount(Decimal::ONE).is_ok());
        assert_matches!(validate_amount(Decimal::ZERO), Err(ServiceError::ValidationError(_)));
        assert_matches!(
            validate_amount(Decimal::NEGATIVE_ONE),
            Err(ServiceError::ValidationError(_))
        );
    }
}
