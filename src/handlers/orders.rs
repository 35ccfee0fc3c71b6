use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Json, Response},
    routing::{get, post, put},
    Router,
};
use tracing::info;
use uuid::Uuid;

use super::common::{cart_session, respond_with_session, JsonBody};
use crate::{
    auth::{AdminUser, AuthUser, MaybeAuthUser},
    errors::ServiceError,
    services::{
        checkout::{CheckoutRequest, CheckoutResponse},
        orders::{AdminOrderUpdate, GuestOrderQuery, OrderListQuery, OrderView},
    },
    ApiResponse, AppState, PaginatedResponse,
};

/// Check out the caller's cart
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Create order",
    description = "Converts the caller's cart into an order, reserves stock and starts the payment. Guests are identified by the `cart_session` cookie and must supply contact fields. Nothing is persisted when stock runs short or the gateway refuses the charge.",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Malformed request or empty cart", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway rejected the charge", body = crate::errors::ErrorResponse)
    ),
    security((), ("Bearer" = [])),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    headers: HeaderMap,
    JsonBody(request): JsonBody<CheckoutRequest>,
) -> Result<Response, ServiceError> {
    let (response, issued) = state
        .services
        .checkout
        .checkout(user.0.as_ref(), cart_session(&headers), request)
        .await?;
    info!(order_id = %response.order.id, "order created");
    Ok(respond_with_session(StatusCode::CREATED, response, issued))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List my orders",
    params(OrderListQuery),
    responses(
        (status = 200, description = "Caller's orders", body = ApiResponse<PaginatedResponse<OrderView>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_my_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderView>>>, ServiceError> {
    let orders = state
        .services
        .orders
        .list_for_user(user.user_id, query)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/admin",
    summary = "List all orders",
    params(OrderListQuery),
    responses(
        (status = 200, description = "All orders", body = ApiResponse<PaginatedResponse<OrderView>>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_all_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderView>>>, ServiceError> {
    let orders = state.services.orders.list_admin(query).await?;
    Ok(Json(ApiResponse::success(orders)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/:id",
    summary = "Get order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order with items, addresses and payment", body = ApiResponse<OrderView>),
        (status = 403, description = "Not the caller's order", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let order = state.services.orders.get(&user, id).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Look up a guest order by id and contact email
#[utoipa::path(
    get,
    path = "/api/v1/orders/guest/:id",
    summary = "Get guest order",
    params(("id" = Uuid, Path, description = "Order ID"), GuestOrderQuery),
    responses(
        (status = 200, description = "Guest order", body = ApiResponse<OrderView>),
        (status = 400, description = "Email missing", body = crate::errors::ErrorResponse),
        (status = 404, description = "No guest order with this id and email", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_guest_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<GuestOrderQuery>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let order = state
        .services
        .orders
        .get_guest(id, query.email.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Cancel an order and return its stock
#[utoipa::path(
    post,
    path = "/api/v1/orders/:id/cancel",
    summary = "Cancel order",
    description = "Only orders still pending or awaiting payment can be cancelled.",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<OrderView>),
        (status = 403, description = "Not the caller's order", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order can no longer be cancelled", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let order = state.services.orders.cancel(&user, id).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    put,
    path = "/api/v1/orders/admin/:id",
    summary = "Override order status or tracking",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = AdminOrderUpdate,
    responses(
        (status = 200, description = "Order updated", body = ApiResponse<OrderView>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn admin_update_order(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    JsonBody(update): JsonBody<AdminOrderUpdate>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    info!(admin = %admin.user_id, order_id = %id, "admin order override");
    let order = state.services.orders.admin_update(id, update).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Order routes, nested under `/orders`.
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_my_orders))
        .route("/admin", get(list_all_orders))
        .route("/admin/:id", put(admin_update_order))
        .route("/guest/:id", get(get_guest_order))
        .route("/:id", get(get_order))
        .route("/:id/cancel", post(cancel_order))
}
