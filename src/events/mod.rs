use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{order::OrderStatus, payment::PaymentStatus};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Domain events emitted after the owning transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        payment_id: Uuid,
        total: Decimal,
    },
    OrderCancelled(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    StockAdjusted {
        product_id: Uuid,
        variant_id: Option<Uuid>,
        delta: i32,
        new_stock: i32,
    },
    PaymentCreated {
        payment_id: Uuid,
        reference_id: String,
        payment_method: String,
    },
    PaymentStatusChanged {
        payment_id: Uuid,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
    },
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                payment_id,
                total,
            } => info!(%order_id, %payment_id, %total, "order created"),
            Event::OrderCancelled(order_id) => info!(%order_id, "order cancelled"),
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => info!(%order_id, %old_status, %new_status, "order status changed"),
            Event::StockAdjusted {
                product_id,
                variant_id,
                delta,
                new_stock,
            } => {
                if *new_stock == 0 {
                    warn!(%product_id, ?variant_id, "stock depleted");
                }
                info!(%product_id, ?variant_id, delta, new_stock, "stock adjusted")
            }
            Event::PaymentCreated {
                payment_id,
                reference_id,
                payment_method,
            } => info!(%payment_id, %reference_id, %payment_method, "payment created"),
            Event::PaymentStatusChanged {
                payment_id,
                old_status,
                new_status,
            } => info!(%payment_id, %old_status, %new_status, "payment status changed"),
        }
    }

    info!("Event channel closed; stopping event processing loop");
}
