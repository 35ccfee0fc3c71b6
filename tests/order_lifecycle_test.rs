mod common;

use axum::http::{Method, StatusCode};
use common::TestApp;
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::entities::order::OrderStatus;
use uuid::Uuid;

struct Placed {
    order_id: Uuid,
    product_id: Uuid,
    token: String,
}

async fn place_order(app: &TestApp, stock: i32, quantity: i32) -> Placed {
    let user = app.seed_user().await;
    let token = app.token_for(user.id, &[]);
    let product = app.seed_product(dec!(80), stock).await;
    app.add_to_cart(Some(&token), None, product.id, None, quantity)
        .await;
    let response = app.checkout(Some(&token), None, json!({})).await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    Placed {
        order_id: serde_json::from_value(response.data()["order"]["id"].clone()).unwrap(),
        product_id: product.id,
        token,
    }
}

async fn set_status(app: &TestApp, order_id: Uuid, status: &str) -> common::TestResponse {
    let admin = app.admin_token();
    app.request(
        Method::PUT,
        &format!("/api/v1/orders/admin/{order_id}"),
        Some(json!({"status": status})),
        Some(&admin),
        None,
    )
    .await
}

#[tokio::test]
async fn cancelling_awaiting_payment_order_restores_stock() {
    let app = TestApp::new().await;
    app.mock_payment_request_ok().await;
    let placed = place_order(&app, 10, 4).await;
    assert_eq!(app.product_stock(placed.product_id).await, 6);

    let updated = set_status(&app, placed.order_id, "awaiting_payment").await;
    assert_eq!(updated.status, StatusCode::OK, "{}", updated.body);
    // Overrides never move stock.
    assert_eq!(app.product_stock(placed.product_id).await, 6);

    let cancelled = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", placed.order_id),
            None,
            Some(&placed.token),
            None,
        )
        .await;
    assert_eq!(cancelled.status, StatusCode::OK, "{}", cancelled.body);
    assert_eq!(cancelled.data()["status"], "cancelled");
    assert_eq!(app.product_stock(placed.product_id).await, 10);
    assert_eq!(
        app.find_order(placed.order_id).await.status,
        OrderStatus::Cancelled
    );

    // A second cancel is a conflict and leaves stock alone.
    let again = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", placed.order_id),
            None,
            Some(&placed.token),
            None,
        )
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);
    assert_eq!(app.product_stock(placed.product_id).await, 10);
}

#[tokio::test]
async fn cancelling_multi_line_order_restores_variant_and_product_stock() {
    let app = TestApp::new().await;
    app.mock_payment_request_ok().await;
    let user = app.seed_user().await;
    let token = app.token_for(user.id, &[]);
    let plain = app.seed_product(dec!(12), 9).await;
    let (sized, large) = app.seed_variant(dec!(40), 6).await;
    let small = app
        .seed_extra_variant(sized.id, "Small", dec!(35), 4)
        .await;

    app.add_to_cart(Some(&token), None, plain.id, None, 2)
        .await;
    app.add_to_cart(Some(&token), None, sized.id, Some(large.id), 3)
        .await;
    app.add_to_cart(Some(&token), None, sized.id, Some(small.id), 1)
        .await;
    let response = app.checkout(Some(&token), None, json!({})).await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    let order_id: Uuid = serde_json::from_value(response.data()["order"]["id"].clone()).unwrap();
    assert_eq!(response.data()["order"]["items"].as_array().unwrap().len(), 3);

    assert_eq!(app.product_stock(plain.id).await, 7);
    assert_eq!(app.variant_stock(large.id).await, 3);
    assert_eq!(app.variant_stock(small.id).await, 3);

    set_status(&app, order_id, "awaiting_payment").await;
    let cancelled = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{order_id}/cancel"),
            None,
            Some(&token),
            None,
        )
        .await;
    assert_eq!(cancelled.status, StatusCode::OK, "{}", cancelled.body);

    assert_eq!(app.product_stock(plain.id).await, 9);
    assert_eq!(app.variant_stock(large.id).await, 6);
    assert_eq!(app.variant_stock(small.id).await, 4);
    // Variant lines never touch the parent product's own counter.
    assert_eq!(app.product_stock(sized.id).await, 0);
}

#[tokio::test]
async fn processing_order_cannot_be_cancelled() {
    let app = TestApp::new().await;
    app.mock_payment_request_ok().await;
    let placed = place_order(&app, 5, 2).await;

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", placed.order_id),
            None,
            Some(&placed.token),
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(response.body["error"], "Conflict");
    assert_eq!(app.product_stock(placed.product_id).await, 3);
}

#[tokio::test]
async fn orders_are_private_to_their_owner() {
    let app = TestApp::new().await;
    app.mock_payment_request_ok().await;
    let placed = place_order(&app, 5, 1).await;
    set_status(&app, placed.order_id, "pending").await;
    let stranger = app.token_for(Uuid::new_v4(), &[]);

    let read = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", placed.order_id),
            None,
            Some(&stranger),
            None,
        )
        .await;
    assert_eq!(read.status, StatusCode::FORBIDDEN);

    let cancel = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", placed.order_id),
            None,
            Some(&stranger),
            None,
        )
        .await;
    assert_eq!(cancel.status, StatusCode::FORBIDDEN);
    assert_eq!(app.find_order(placed.order_id).await.status, OrderStatus::Pending);

    let admin = app.admin_token();
    let as_admin = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", placed.order_id),
            None,
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(as_admin.status, StatusCode::OK);
    assert_eq!(as_admin.data()["items"][0]["quantity"], 1);

    let missing = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", Uuid::new_v4()),
            None,
            Some(&placed.token),
            None,
        )
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_endpoints_require_admin_role() {
    let app = TestApp::new().await;
    app.mock_payment_request_ok().await;
    let placed = place_order(&app, 5, 1).await;

    let list = app
        .request(Method::GET, "/api/v1/orders/admin", None, Some(&placed.token), None)
        .await;
    assert_eq!(list.status, StatusCode::FORBIDDEN);

    let update = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/admin/{}", placed.order_id),
            Some(json!({"status": "shipped"})),
            Some(&placed.token),
            None,
        )
        .await;
    assert_eq!(update.status, StatusCode::FORBIDDEN);

    let anonymous = app
        .request(Method::GET, "/api/v1/orders/admin", None, None, None)
        .await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_override_sets_tracking_and_status() {
    let app = TestApp::new().await;
    app.mock_payment_request_ok().await;
    let placed = place_order(&app, 5, 1).await;
    let admin = app.admin_token();

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/admin/{}", placed.order_id),
            Some(json!({"status": "shipped", "tracking_number": "  LBC-123456  "})),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    assert_eq!(response.data()["status"], "shipped");
    assert_eq!(response.data()["tracking_number"], "LBC-123456");

    let bad_status = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/admin/{}", placed.order_id),
            Some(json!({"status": "teleported"})),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(bad_status.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn order_listing_paginates_and_scopes() {
    let app = TestApp::new().await;
    app.mock_payment_request_ok().await;
    let user = app.seed_user().await;
    let token = app.token_for(user.id, &[]);
    let product = app.seed_product(dec!(12), 50).await;
    for _ in 0..3 {
        app.add_to_cart(Some(&token), None, product.id, None, 1)
            .await;
        let response = app.checkout(Some(&token), None, json!({})).await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    }
    // Someone else's order stays out of this user's list.
    place_order(&app, 5, 1).await;

    let first = app
        .request(Method::GET, "/api/v1/orders?per_page=2", None, Some(&token), None)
        .await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.data()["total"], 3);
    assert_eq!(first.data()["total_pages"], 2);
    assert_eq!(first.data()["items"].as_array().unwrap().len(), 2);

    let second = app
        .request(
            Method::GET,
            "/api/v1/orders?per_page=2&page=2",
            None,
            Some(&token),
            None,
        )
        .await;
    assert_eq!(second.data()["items"].as_array().unwrap().len(), 1);

    let admin = app.admin_token();
    let all = app
        .request(Method::GET, "/api/v1/orders/admin", None, Some(&admin), None)
        .await;
    assert_eq!(all.status, StatusCode::OK);
    assert_eq!(all.data()["total"], 4);
    assert_eq!(all.data()["per_page"], 20);

    let filtered = app
        .request(
            Method::GET,
            "/api/v1/orders/admin?status=cancelled",
            None,
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(filtered.data()["total"], 0);
}
