mod common;

use axum::http::{Method, StatusCode};
use common::{TestApp, WEBHOOK_TOKEN};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use storefront_api::entities::{order::OrderStatus, payment::PaymentStatus};
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

/// Checks out one unit for a fresh user; returns (order id, payment id, request id, token).
async fn placed_order(app: &TestApp) -> (Uuid, Uuid, String, String) {
    app.mock_payment_request_ok().await;
    let user = app.seed_user().await;
    let token = app.token_for(user.id, &[]);
    let product = app.seed_product(dec!(250), 3).await;
    app.add_to_cart(Some(&token), None, product.id, None, 1)
        .await;
    let response = app.checkout(Some(&token), None, json!({})).await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);

    let order_id = serde_json::from_value(response.data()["order"]["id"].clone()).unwrap();
    let payment = &response.data()["payment"];
    let payment_id = serde_json::from_value(payment["id"].clone()).unwrap();
    let request_id = payment["payment_request_id"].as_str().unwrap().to_string();
    (order_id, payment_id, request_id, token)
}

fn succeeded_payment_event(request_id: &str) -> String {
    json!({
        "event": "payment.capture",
        "data": {
            "payment_id": "py-7f1c",
            "payment_request_id": request_id,
            "status": "SUCCEEDED"
        }
    })
    .to_string()
}

#[tokio::test]
async fn succeeded_webhook_marks_payment_paid_and_is_idempotent() {
    let app = TestApp::new().await;
    let (order_id, payment_id, request_id, _) = placed_order(&app).await;

    // Order sits in awaiting_payment until the gateway confirms.
    let admin = app.admin_token();
    app.request(
        Method::PUT,
        &format!("/api/v1/orders/admin/{order_id}"),
        Some(json!({"status": "awaiting_payment"})),
        Some(&admin),
        None,
    )
    .await;

    let first = app
        .webhook(&succeeded_payment_event(&request_id), Some(WEBHOOK_TOKEN))
        .await;
    assert_eq!(first.status, StatusCode::OK, "{}", first.body);
    assert_eq!(first.data()["status"], "paid");
    assert_eq!(first.data()["family"], "payment");
    assert_eq!(first.data()["changed"], true);

    let paid = app.find_payment(payment_id).await;
    assert_eq!(paid.status, PaymentStatus::Paid);
    assert!(paid.payment_date.is_some());
    assert_eq!(paid.gateway_transaction_id.as_deref(), Some("py-7f1c"));
    assert_eq!(app.find_order(order_id).await.status, OrderStatus::Processing);

    let replay = app
        .webhook(&succeeded_payment_event(&request_id), Some(WEBHOOK_TOKEN))
        .await;
    assert_eq!(replay.status, StatusCode::OK);
    assert_eq!(replay.data()["changed"], false);

    let after = app.find_payment(payment_id).await;
    assert_eq!(after, paid);
    assert_eq!(app.find_order(order_id).await.status, OrderStatus::Processing);
}

#[tokio::test]
async fn paid_is_not_downgraded_by_late_failure() {
    let app = TestApp::new().await;
    let (_, payment_id, request_id, _) = placed_order(&app).await;

    app.webhook(&succeeded_payment_event(&request_id), Some(WEBHOOK_TOKEN))
        .await;
    let late = json!({
        "event": "payment_request.failed",
        "data": {"id": request_id, "status": "FAILED"}
    });
    let response = app.webhook(&late.to_string(), Some(WEBHOOK_TOKEN)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.data()["status"], "paid");
    assert_eq!(app.find_payment(payment_id).await.status, PaymentStatus::Paid);
}

#[tokio::test]
async fn bad_callback_token_is_forbidden_and_changes_nothing() {
    let app = TestApp::new().await;
    let (_, payment_id, request_id, _) = placed_order(&app).await;
    let before = app.find_payment(payment_id).await;

    let wrong = app
        .webhook(&succeeded_payment_event(&request_id), Some("guess"))
        .await;
    assert_eq!(wrong.status, StatusCode::FORBIDDEN);

    let missing = app
        .webhook(&succeeded_payment_event(&request_id), None)
        .await;
    assert_eq!(missing.status, StatusCode::FORBIDDEN);

    // The token is checked before the body is parsed.
    let garbage = app.webhook("not json", Some("guess")).await;
    assert_eq!(garbage.status, StatusCode::FORBIDDEN);

    assert_eq!(app.find_payment(payment_id).await, before);
}

#[tokio::test]
async fn malformed_and_unknown_payloads_are_refused() {
    let app = TestApp::new().await;
    let (_, payment_id, request_id, _) = placed_order(&app).await;

    let not_json = app.webhook("{{{", Some(WEBHOOK_TOKEN)).await;
    assert_eq!(not_json.status, StatusCode::BAD_REQUEST);

    let array = app.webhook("[1, 2]", Some(WEBHOOK_TOKEN)).await;
    assert_eq!(array.status, StatusCode::BAD_REQUEST);

    let no_status = json!({"event": "payment.capture", "data": {"payment_request_id": request_id}});
    let response = app
        .webhook(&no_status.to_string(), Some(WEBHOOK_TOKEN))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let unknown = json!({"event": "refund.succeeded", "data": {"status": "SUCCEEDED"}});
    let response = app.webhook(&unknown.to_string(), Some(WEBHOOK_TOKEN)).await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);

    assert_eq!(app.find_payment(payment_id).await.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn webhook_for_unknown_payment_is_not_found() {
    let app = TestApp::new().await;
    let payload = json!({"id": "inv-unknown", "external_id": "invoice_guest_1", "status": "PAID"});
    let response = app.webhook(&payload.to_string(), Some(WEBHOOK_TOKEN)).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn legacy_invoice_callback_matches_by_external_id() {
    let app = TestApp::new().await;
    Mock::given(method("POST"))
        .and(path("/v2/invoices"))
        .respond_with(|req: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
            ResponseTemplate::new(200).set_body_json(json!({
                "id": "inv-001",
                "external_id": body["external_id"],
                "status": "PENDING",
                "invoice_url": "https://invoice.example.com/inv-001",
                "expiry_date": "2030-01-01T00:00:00Z"
            }))
        })
        .mount(&app.gateway)
        .await;

    let created = app
        .request(
            Method::POST,
            "/api/v1/payments/create-invoice",
            Some(json!({"amount": 1500, "description": "Gift card"})),
            None,
            None,
        )
        .await;
    assert_eq!(created.status, StatusCode::OK, "{}", created.body);
    let payment = &created.data()["payment"];
    let reference = payment["reference_id"].as_str().unwrap().to_string();
    assert!(reference.starts_with("invoice_guest_"));
    assert_eq!(payment["payment_method"], "xendit_invoice");
    assert_eq!(
        created.data()["invoice_url"],
        "https://invoice.example.com/inv-001"
    );
    let payment_id: Uuid = serde_json::from_value(payment["id"].clone()).unwrap();

    // Flat callback without an event name; the id is new to us, the external id is not.
    let callback = json!({"id": "inv-other", "external_id": reference, "status": "PAID"});
    let response = app
        .webhook(&callback.to_string(), Some(WEBHOOK_TOKEN))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    assert_eq!(response.data()["family"], "legacy");
    assert_eq!(app.find_payment(payment_id).await.status, PaymentStatus::Paid);
}

#[tokio::test]
async fn session_webhook_matches_by_session_id() {
    let app = TestApp::new().await;
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "payment_session_id": "ps-900",
            "status": "ACTIVE",
            "payment_link_url": "https://checkout.example.com/ps-900"
        })))
        .mount(&app.gateway)
        .await;
    let user = app.seed_user().await;
    let token = app.token_for(user.id, &[]);

    let created = app
        .request(
            Method::POST,
            "/api/v1/payments/create-payment-request",
            Some(json!({"amount": "499.00", "payment_method": {"type": "card"}})),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(created.status, StatusCode::OK, "{}", created.body);
    assert_eq!(created.data()["payment_session_id"], "ps-900");
    let payment_id: Uuid =
        serde_json::from_value(created.data()["payment"]["id"].clone()).unwrap();

    let event = json!({
        "event": "payment_session.completed",
        "data": {
            "payment_session_id": "ps-900",
            "reference_id": "unrelated",
            "payment_request_id": "pr-from-session",
            "status": "COMPLETED"
        }
    });
    let response = app.webhook(&event.to_string(), Some(WEBHOOK_TOKEN)).await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);

    let payment = app.find_payment(payment_id).await;
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(payment.payment_request_id.as_deref(), Some("pr-from-session"));
    assert!(payment.session_data.is_some());
}

#[tokio::test]
async fn status_polling_reconciles_and_checks_ownership() {
    let app = TestApp::new().await;
    let (order_id, payment_id, request_id, token) = placed_order(&app).await;
    Mock::given(method("GET"))
        .and(path(format!("/v3/payment_requests/{request_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "payment_request_id": request_id,
            "status": "SUCCEEDED",
            "latest_payment_id": "py-polled"
        })))
        .mount(&app.gateway)
        .await;

    let stranger = app.token_for(Uuid::new_v4(), &[]);
    let denied = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/status/{payment_id}"),
            None,
            Some(&stranger),
            None,
        )
        .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let unauthenticated = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/status/{payment_id}"),
            None,
            None,
            None,
        )
        .await;
    assert_eq!(unauthenticated.status, StatusCode::UNAUTHORIZED);

    let polled = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/status/{payment_id}"),
            None,
            Some(&token),
            None,
        )
        .await;
    assert_eq!(polled.status, StatusCode::OK, "{}", polled.body);
    assert_eq!(polled.data()["status"], "paid");
    assert_eq!(polled.data()["gateway_transaction_id"], "py-polled");
    assert_eq!(app.find_order(order_id).await.status, OrderStatus::Processing);

    let missing = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/status/{}", Uuid::new_v4()),
            None,
            Some(&token),
            None,
        )
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn payment_listings_are_scoped() {
    let app = TestApp::new().await;
    let (_, payment_id, _, token) = placed_order(&app).await;
    placed_order(&app).await;

    let mine = app
        .request(Method::GET, "/api/v1/payments/my-payments", None, Some(&token), None)
        .await;
    assert_eq!(mine.status, StatusCode::OK);
    assert_eq!(mine.data()["total"], 1);
    assert_eq!(mine.data()["per_page"], 10);
    assert_eq!(mine.data()["items"][0]["id"], json!(payment_id));

    let forbidden = app
        .request(Method::GET, "/api/v1/payments/admin", None, Some(&token), None)
        .await;
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

    let admin = app.admin_token();
    let all = app
        .request(
            Method::GET,
            "/api/v1/payments/admin?payment_method=GCASH",
            None,
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(all.status, StatusCode::OK);
    assert_eq!(all.data()["total"], 2);
    assert_eq!(all.data()["per_page"], 20);

    let single = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/{payment_id}"),
            None,
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(single.status, StatusCode::OK);
}

#[tokio::test]
async fn virtual_account_requires_positive_amount() {
    let app = TestApp::new().await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-virtual-account",
            Some(json!({"amount": 0})),
            None,
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(app.gateway.received_requests().await.unwrap().len(), 0);
}
