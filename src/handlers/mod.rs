pub mod cart;
pub mod common;
pub mod orders;
pub mod payments;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::{
    config::AppConfig,
    events::EventSender,
    services::{
        carts::CartService, checkout::CheckoutService, gateway::GatewayClient,
        orders::OrderService, payments::PaymentService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub checkout: Arc<CheckoutService>,
    pub payments: Arc<PaymentService>,
}

impl AppServices {
    /// Wires every service against one connection pool and gateway client.
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<GatewayClient>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            carts: Arc::new(CartService::new(db.clone())),
            orders: Arc::new(OrderService::new(db.clone(), event_sender.clone())),
            checkout: Arc::new(CheckoutService::new(
                db.clone(),
                gateway.clone(),
                config.clone(),
                event_sender.clone(),
            )),
            payments: Arc::new(PaymentService::new(db, gateway, config, event_sender)),
        }
    }
}
