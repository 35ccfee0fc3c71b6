use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::common::JsonBody;
use crate::{
    auth::{AdminUser, AuthUser, MaybeAuthUser},
    errors::ServiceError,
    services::payments::{
        CreateInvoiceRequest, CreatePaymentRequestBody, CreateVirtualAccountRequest,
        InvoiceCreated, PaymentListQuery, PaymentRequestCreated, PaymentView,
        VirtualAccountCreated, WebhookOutcome,
    },
    ApiResponse, AppState, PaginatedResponse,
};

/// Header the gateway uses to present the shared callback secret.
pub const CALLBACK_TOKEN_HEADER: &str = "x-callback-token";

#[utoipa::path(
    post,
    path = "/api/v1/payments/create-invoice",
    summary = "Create hosted invoice",
    request_body = CreateInvoiceRequest,
    responses(
        (status = 200, description = "Invoice created", body = ApiResponse<InvoiceCreated>),
        (status = 400, description = "Invalid amount or currency", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway error", body = crate::errors::ErrorResponse)
    ),
    security((), ("Bearer" = [])),
    tag = "Payments"
)]
pub async fn create_invoice(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    JsonBody(request): JsonBody<CreateInvoiceRequest>,
) -> Result<Json<ApiResponse<InvoiceCreated>>, ServiceError> {
    let created = state
        .services
        .payments
        .create_invoice(user.user_id(), request)
        .await?;
    Ok(Json(ApiResponse::success(created)))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/create-virtual-account",
    summary = "Create bank virtual account",
    request_body = CreateVirtualAccountRequest,
    responses(
        (status = 200, description = "Virtual account created", body = ApiResponse<VirtualAccountCreated>),
        (status = 400, description = "Invalid amount or bank code", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway error", body = crate::errors::ErrorResponse)
    ),
    security((), ("Bearer" = [])),
    tag = "Payments"
)]
pub async fn create_virtual_account(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    JsonBody(request): JsonBody<CreateVirtualAccountRequest>,
) -> Result<Json<ApiResponse<VirtualAccountCreated>>, ServiceError> {
    let created = state
        .services
        .payments
        .create_virtual_account(user.user_id(), request)
        .await?;
    Ok(Json(ApiResponse::success(created)))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/create-payment-request",
    summary = "Create payment request",
    description = "Charges a card, e-wallet or bank channel. A card without token or details opens a hosted card session instead.",
    request_body = CreatePaymentRequestBody,
    responses(
        (status = 200, description = "Payment request created", body = ApiResponse<PaymentRequestCreated>),
        (status = 400, description = "Invalid amount or payment method", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway error", body = crate::errors::ErrorResponse)
    ),
    security((), ("Bearer" = [])),
    tag = "Payments"
)]
pub async fn create_payment_request(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    JsonBody(request): JsonBody<CreatePaymentRequestBody>,
) -> Result<Json<ApiResponse<PaymentRequestCreated>>, ServiceError> {
    let created = state
        .services
        .payments
        .create_payment_request(user.user_id(), request)
        .await?;
    Ok(Json(ApiResponse::success(created)))
}

/// Gateway notification endpoint
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    summary = "Gateway webhook",
    description = "Authenticated by the `x-callback-token` header. Replays are acknowledged without changing state.",
    request_body = Object,
    params(("x-callback-token" = String, Header, description = "Shared callback secret")),
    responses(
        (status = 200, description = "Notification applied", body = ApiResponse<WebhookOutcome>),
        (status = 400, description = "Malformed payload", body = crate::errors::ErrorResponse),
        (status = 403, description = "Bad callback token", body = crate::errors::ErrorResponse),
        (status = 404, description = "No matching payment", body = crate::errors::ErrorResponse),
        (status = 422, description = "Unsupported event", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<WebhookOutcome>>, ServiceError> {
    let token = headers
        .get(CALLBACK_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());

    // Undecodable bodies still go through the token check before being refused.
    let payload: Value = serde_json::from_slice(&body).unwrap_or_else(|err| {
        warn!(error = %err, "webhook body is not valid JSON");
        Value::Null
    });

    let outcome = state
        .services
        .payments
        .handle_webhook(token, &payload)
        .await?;
    info!(
        payment_id = %outcome.payment_id,
        status = %outcome.status,
        changed = outcome.changed,
        "webhook processed"
    );
    Ok(Json(ApiResponse::success(outcome)))
}

/// Poll the gateway for a payment's current status
#[utoipa::path(
    get,
    path = "/api/v1/payments/status/:id",
    summary = "Check payment status",
    params(("id" = Uuid, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "Reconciled payment", body = ApiResponse<PaymentView>),
        (status = 403, description = "Not the caller's payment", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway error", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn check_payment_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentView>>, ServiceError> {
    let payment = state.services.payments.check_status(&user, id).await?;
    Ok(Json(ApiResponse::success(payment)))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/admin",
    summary = "List all payments",
    params(PaymentListQuery),
    responses(
        (status = 200, description = "Payments", body = ApiResponse<PaginatedResponse<PaymentView>>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn list_all_payments(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<PaymentListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<PaymentView>>>, ServiceError> {
    let payments = state.services.payments.list_admin(query).await?;
    Ok(Json(ApiResponse::success(payments)))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/my-payments",
    summary = "List my payments",
    params(PaymentListQuery),
    responses(
        (status = 200, description = "Caller's payments", body = ApiResponse<PaginatedResponse<PaymentView>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn list_my_payments(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<PaymentListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<PaymentView>>>, ServiceError> {
    let payments = state
        .services
        .payments
        .my_payments(user.user_id, query)
        .await?;
    Ok(Json(ApiResponse::success(payments)))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/:id",
    summary = "Get payment",
    params(("id" = Uuid, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "Payment", body = ApiResponse<PaymentView>),
        (status = 403, description = "Not the caller's payment", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn get_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentView>>, ServiceError> {
    let payment = state.services.payments.get(&user, id).await?;
    Ok(Json(ApiResponse::success(payment)))
}

/// Payment routes, nested under `/payments`.
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/create-invoice", post(create_invoice))
        .route("/create-virtual-account", post(create_virtual_account))
        .route("/create-payment-request", post(create_payment_request))
        .route("/webhook", post(payment_webhook))
        .route("/status/:id", get(check_payment_status))
        .route("/admin", get(list_all_payments))
        .route("/my-payments", get(list_my_payments))
        .route("/:id", get(get_payment))
}
