use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::{handlers, services};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "0.1.0",
        description = r#"
# Storefront API

Order and payment core of a storefront: carts, checkout, order lifecycle and
payment gateway reconciliation.

## Authentication

Signed-in shoppers send a JWT bearer token:

```
Authorization: Bearer <your-jwt-token>
```

Guests are identified by the `cart_session` cookie, which the API issues the
first time it creates a cart for them. Admin endpoints require the `admin`
role. The gateway webhook is authenticated by the `x-callback-token` header.

## Error Handling

Errors share one body format:

```json
{
  "error": "Unprocessable Entity",
  "message": "Insufficient stock for product ...",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-12-09T10:30:00.000Z"
}
```

Gateway failures carry the gateway's error code in `details`.

## Pagination

List endpoints take `page` (default 1) and `per_page` (default 10, 20 for
admin lists, max 100).
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Cart", description = "Shopping cart endpoints"),
        (name = "Orders", description = "Checkout and order management endpoints"),
        (name = "Payments", description = "Payment creation, status and webhook endpoints")
    ),
    paths(
        // Cart
        handlers::cart::get_cart,
        handlers::cart::add_to_cart,
        handlers::cart::update_cart_item,
        handlers::cart::remove_cart_item,
        handlers::cart::clear_cart,

        // Orders
        handlers::orders::create_order,
        handlers::orders::list_my_orders,
        handlers::orders::list_all_orders,
        handlers::orders::get_order,
        handlers::orders::get_guest_order,
        handlers::orders::cancel_order,
        handlers::orders::admin_update_order,

        // Payments
        handlers::payments::create_invoice,
        handlers::payments::create_virtual_account,
        handlers::payments::create_payment_request,
        handlers::payments::payment_webhook,
        handlers::payments::check_payment_status,
        handlers::payments::list_all_payments,
        handlers::payments::list_my_payments,
        handlers::payments::get_payment,
    ),
    components(
        schemas(
            // Common types
            crate::ApiResponse<serde_json::Value>,
            crate::PaginatedResponse<serde_json::Value>,

            // Cart types
            services::carts::CartView,
            services::carts::CartLineView,
            services::carts::AddToCartRequest,
            services::carts::UpdateCartItemRequest,

            // Order types
            services::checkout::CheckoutRequest,
            services::checkout::CheckoutResponse,
            services::orders::OrderView,
            services::orders::OrderItemView,
            services::orders::AdminOrderUpdate,
            services::addresses::AddressInput,
            services::addresses::AddressFields,
            services::addresses::AddressView,
            crate::entities::order::OrderStatus,

            // Payment types
            services::gateway::PaymentMethodRequest,
            services::gateway::EWalletType,
            services::gateway::CardDetails,
            services::payments::PaymentView,
            services::payments::CreateInvoiceRequest,
            services::payments::CreateVirtualAccountRequest,
            services::payments::CreatePaymentRequestBody,
            services::payments::InvoiceCreated,
            services::payments::VirtualAccountCreated,
            services::payments::PaymentRequestCreated,
            services::payments::ChargeLinks,
            services::payments::WebhookOutcome,
            services::payments::EventFamily,
            crate::entities::payment::PaymentStatus,

            // Error types
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&BearerAuth)
)]
pub struct ApiDocV1;

/// Registers the `Bearer` scheme referenced by the handlers.
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "Bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
