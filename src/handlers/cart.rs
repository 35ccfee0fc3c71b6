use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{delete, get, put},
    Router,
};
use uuid::Uuid;

use super::common::{cart_session, respond_with_session, JsonBody};
use crate::{
    auth::MaybeAuthUser,
    errors::ServiceError,
    services::carts::{AddToCartRequest, CartOwner, CartView, UpdateCartItemRequest},
    AppState,
};

fn owner(user: &MaybeAuthUser, headers: &HeaderMap) -> CartOwner {
    CartOwner::new(user.user_id(), cart_session(headers))
}

/// Get the caller's cart
#[utoipa::path(
    get,
    path = "/api/v1/cart",
    summary = "Get cart",
    description = "Resolves the cart for the signed-in user or the `cart_session` cookie, merging a guest cart into the user's on first sign-in.",
    responses(
        (status = 200, description = "Current cart", body = crate::ApiResponse<CartView>),
        (status = 401, description = "Invalid bearer token", body = crate::errors::ErrorResponse)
    ),
    security((), ("Bearer" = [])),
    tag = "Cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let (cart, issued) = state.services.carts.get_cart(&owner(&user, &headers)).await?;
    Ok(respond_with_session(StatusCode::OK, cart, issued))
}

/// Add an item to the cart
#[utoipa::path(
    post,
    path = "/api/v1/cart",
    summary = "Add to cart",
    request_body = AddToCartRequest,
    responses(
        (status = 200, description = "Updated cart", body = crate::ApiResponse<CartView>),
        (status = 400, description = "Invalid quantity or inactive product", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product or variant not found", body = crate::errors::ErrorResponse)
    ),
    security((), ("Bearer" = [])),
    tag = "Cart"
)]
pub async fn add_to_cart(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    headers: HeaderMap,
    JsonBody(request): JsonBody<AddToCartRequest>,
) -> Result<Response, ServiceError> {
    let (cart, issued) = state
        .services
        .carts
        .add_item(&owner(&user, &headers), request)
        .await?;
    Ok(respond_with_session(StatusCode::OK, cart, issued))
}

/// Set a cart line's quantity
#[utoipa::path(
    put,
    path = "/api/v1/cart/:item_id",
    summary = "Update cart item",
    description = "A quantity of zero or less removes the line.",
    params(("item_id" = Uuid, Path, description = "Cart item ID")),
    request_body = UpdateCartItemRequest,
    responses(
        (status = 200, description = "Updated cart", body = crate::ApiResponse<CartView>),
        (status = 404, description = "Line not in this cart", body = crate::errors::ErrorResponse)
    ),
    security((), ("Bearer" = [])),
    tag = "Cart"
)]
pub async fn update_cart_item(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    headers: HeaderMap,
    Path(item_id): Path<Uuid>,
    JsonBody(request): JsonBody<UpdateCartItemRequest>,
) -> Result<Response, ServiceError> {
    let (cart, issued) = state
        .services
        .carts
        .update_item(&owner(&user, &headers), item_id, request.quantity)
        .await?;
    Ok(respond_with_session(StatusCode::OK, cart, issued))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart/:item_id",
    summary = "Remove cart item",
    params(("item_id" = Uuid, Path, description = "Cart item ID")),
    responses(
        (status = 200, description = "Updated cart", body = crate::ApiResponse<CartView>),
        (status = 404, description = "Line not in this cart", body = crate::errors::ErrorResponse)
    ),
    security((), ("Bearer" = [])),
    tag = "Cart"
)]
pub async fn remove_cart_item(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    headers: HeaderMap,
    Path(item_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let (cart, issued) = state
        .services
        .carts
        .remove_item(&owner(&user, &headers), item_id)
        .await?;
    Ok(respond_with_session(StatusCode::OK, cart, issued))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart/clear",
    summary = "Empty the cart",
    responses(
        (status = 200, description = "Empty cart", body = crate::ApiResponse<CartView>)
    ),
    security((), ("Bearer" = [])),
    tag = "Cart"
)]
pub async fn clear_cart(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let (cart, issued) = state.services.carts.clear(&owner(&user, &headers)).await?;
    Ok(respond_with_session(StatusCode::OK, cart, issued))
}

/// Cart routes, nested under `/cart`.
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart).post(add_to_cart))
        .route("/clear", delete(clear_cart))
        .route("/:item_id", put(update_cart_item).delete(remove_cart_item))
}
