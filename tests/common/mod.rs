#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use storefront_api::{
    auth::{AuthConfig, ADMIN_ROLE},
    config::{AppConfig, GatewaySettings},
    db,
    entities::{cart, order, payment, product, product_variant, user},
    events::{self, EventSender},
    services::gateway::GatewayClient,
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const WEBHOOK_TOKEN: &str = "test-callback-token";

/// Response status and decoded JSON body.
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub set_cookie: Option<String>,
}

impl TestResponse {
    /// The `data` member of the success envelope.
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }

    /// Cart token from a `Set-Cookie` header, if the response issued one.
    pub fn cart_session(&self) -> Option<String> {
        let cookie = self.set_cookie.as_deref()?;
        let pair = cookie.split(';').next()?;
        pair.strip_prefix("cart_session=").map(str::to_string)
    }
}

/// Reads a decimal that may be serialized as a string or a number.
pub fn dec(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("expected decimal, got {other}"),
    }
}

/// Helper harness for spinning up an application state backed by an in-memory SQLite database
/// and a mock payment gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: MockServer,
    auth: AuthConfig,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let gateway = MockServer::start().await;

        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "https://shop.example.com".to_string(),
            GatewaySettings::new(
                "xnd_development_test_key".to_string(),
                WEBHOOK_TOKEN.to_string(),
                gateway.uri(),
            ),
            "test".to_string(),
        );
        // A single connection keeps the in-memory database alive and shared.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let client = GatewayClient::new(&cfg.gateway).expect("gateway client");
        let state = AppState::new(
            Arc::new(pool),
            Arc::new(cfg),
            Arc::new(EventSender::new(event_tx)),
            Arc::new(client),
        );
        let router = storefront_api::build_router(state.clone());

        Self {
            router,
            auth: AuthConfig::new(JWT_SECRET),
            state,
            gateway,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    /// Bearer token for `user_id` with the given roles.
    pub fn token_for(&self, user_id: Uuid, roles: &[&str]) -> String {
        self.auth
            .issue_token(
                user_id,
                Some(format!("{}@example.com", user_id.simple())),
                roles.iter().map(|r| r.to_string()).collect(),
                chrono::Duration::hours(1),
            )
            .expect("issue token")
    }

    pub fn admin_token(&self) -> String {
        self.token_for(Uuid::new_v4(), &[ADMIN_ROLE])
    }

    /// Send a request against the router with optional bearer token and cart cookie.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
        cart_session: Option<&str>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", tok));
        }
        if let Some(session) = cart_session {
            builder = builder.header(header::COOKIE, format!("cart_session={}", session));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    /// Send a fully built request.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request");
        let status = response.status();
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        TestResponse {
            status,
            body,
            set_cookie,
        }
    }

    /// Delivers a webhook with the given callback token.
    pub async fn webhook(&self, payload: &str, token: Option<&str>) -> TestResponse {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header("x-callback-token", token);
        }
        self.send(builder.body(Body::from(payload.to_string())).unwrap())
            .await
    }

    pub async fn seed_user(&self) -> user::Model {
        let id = Uuid::new_v4();
        user::ActiveModel {
            id: Set(id),
            email: Set(format!("{}@example.com", id.simple())),
            first_name: Set("Maria".to_string()),
            last_name: Set("Santos".to_string()),
            phone_number: Set(Some("+639171234567".to_string())),
            country_code: Set(Some("PH".to_string())),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed user")
    }

    /// A product sold without variants.
    pub async fn seed_product(&self, price: Decimal, stock: i32) -> product::Model {
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set(format!("Product {}", &id.simple().to_string()[..8])),
            slug: Set(format!("product-{}", id.simple())),
            base_price: Set(price),
            sale_price: Set(None),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed product")
    }

    /// A product with one variant carrying the price and stock.
    pub async fn seed_variant(
        &self,
        price: Decimal,
        stock: i32,
    ) -> (product::Model, product_variant::Model) {
        let product = self.seed_product(price, 0).await;
        let variant = product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            name: Set("Large".to_string()),
            base_price: Set(price),
            sale_price: Set(None),
            stock: Set(stock),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed variant");
        (product, variant)
    }

    /// Another variant on an existing product, created after any earlier ones.
    pub async fn seed_extra_variant(
        &self,
        product_id: Uuid,
        name: &str,
        price: Decimal,
        stock: i32,
    ) -> product_variant::Model {
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            name: Set(name.to_string()),
            base_price: Set(price),
            sale_price: Set(None),
            stock: Set(stock),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed variant")
    }

    async fn update_product(&self, id: Uuid, edit: impl FnOnce(&mut product::ActiveModel)) {
        let model = product::Entity::find_by_id(id)
            .one(self.db())
            .await
            .unwrap()
            .expect("product exists");
        let mut active: product::ActiveModel = model.into();
        edit(&mut active);
        active.update(self.db()).await.expect("update product");
    }

    pub async fn set_product_active(&self, id: Uuid, active: bool) {
        self.update_product(id, |p| p.is_active = Set(active)).await;
    }

    pub async fn set_sale_price(&self, id: Uuid, price: Option<Decimal>) {
        self.update_product(id, |p| p.sale_price = Set(price)).await;
    }

    pub async fn product_stock(&self, id: Uuid) -> i32 {
        product::Entity::find_by_id(id)
            .one(self.db())
            .await
            .unwrap()
            .expect("product exists")
            .stock
    }

    pub async fn variant_stock(&self, id: Uuid) -> i32 {
        product_variant::Entity::find_by_id(id)
            .one(self.db())
            .await
            .unwrap()
            .expect("variant exists")
            .stock
    }

    pub async fn order_count(&self) -> usize {
        order::Entity::find().all(self.db()).await.unwrap().len()
    }

    pub async fn payment_count(&self) -> usize {
        payment::Entity::find().all(self.db()).await.unwrap().len()
    }

    pub async fn cart_count(&self) -> usize {
        cart::Entity::find().all(self.db()).await.unwrap().len()
    }

    pub async fn find_payment(&self, id: Uuid) -> payment::Model {
        payment::Entity::find_by_id(id)
            .one(self.db())
            .await
            .unwrap()
            .expect("payment exists")
    }

    pub async fn find_order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(self.db())
            .await
            .unwrap()
            .expect("order exists")
    }

    /// Adds a line to the cart of `token` (or the guest `session`).
    pub async fn add_to_cart(
        &self,
        token: Option<&str>,
        session: Option<&str>,
        product_id: Uuid,
        variant_id: Option<Uuid>,
        quantity: i32,
    ) -> TestResponse {
        self.request(
            Method::POST,
            "/api/v1/cart",
            Some(json!({
                "product_id": product_id,
                "variant_id": variant_id,
                "quantity": quantity,
            })),
            token,
            session,
        )
        .await
    }

    /// Gateway accepts every payment request with a fresh id and a web checkout URL.
    pub async fn mock_payment_request_ok(&self) {
        Mock::given(method("POST"))
            .and(path("/v3/payment_requests"))
            .respond_with(move |req: &wiremock::Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
                let id = format!("pr-{}", Uuid::new_v4().simple());
                ResponseTemplate::new(201).set_body_json(json!({
                    "payment_request_id": id,
                    "reference_id": body["reference_id"],
                    "status": "REQUIRES_ACTION",
                    "actions": [
                        {"type": "REDIRECT_CUSTOMER", "descriptor": "WEB_URL", "value": format!("https://pay.example.com/{id}")}
                    ]
                }))
            })
            .mount(&self.gateway)
            .await;
    }

    /// Gateway refuses every payment request.
    pub async fn mock_payment_request_rejected(&self) {
        Mock::given(method("POST"))
            .and(path("/v3/payment_requests"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error_code": "CHANNEL_NOT_ACTIVATED",
                "message": "Channel is not activated"
            })))
            .mount(&self.gateway)
            .await;
    }

    /// Posts a checkout paid by GCash; guest contact fields are included.
    pub async fn checkout(
        &self,
        token: Option<&str>,
        session: Option<&str>,
        extra: Value,
    ) -> TestResponse {
        let mut body = json!({
            "shipping_address": {
                "line_1": "6750 Ayala Avenue",
                "city": "Makati",
                "zip_code": "1226",
                "country": "PH"
            },
            "same_as_shipping": true,
            "payment_method": {"type": "ewallet", "wallet": "gcash"},
            "email": "shopper@example.com",
            "first_name": "Juan",
            "last_name": "Dela Cruz",
            "phone_number": "+639170000000"
        });
        if let (Some(target), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        self.request(Method::POST, "/api/v1/orders", Some(body), token, session)
            .await
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}
