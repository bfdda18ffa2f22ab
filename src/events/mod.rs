use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{OrderStatus, PaymentStatus};

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

    /// Sends an event, logging instead of failing when the consumer is gone.
    /// Domain state is already committed when events are emitted.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Things that happened to an order, emitted after the database commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        status: OrderStatus,
        payment_status: PaymentStatus,
        external_payment_id: Option<String>,
    },
    StockDecremented {
        order_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CheckoutFailed {
        order_id: Option<Uuid>,
        error_code: String,
    },
    WebhookIgnored {
        event_type: String,
        reason: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::StockDecremented { .. } => "stock_decremented",
            Event::CheckoutFailed { .. } => "checkout_failed",
            Event::WebhookIgnored { .. } => "webhook_ignored",
        }
    }
}

/// Consumes the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("checkout_events_total", 1, "event" => event.name());

        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
            } => info!(%order_id, %order_number, "Order created"),
            Event::OrderStatusChanged {
                order_id,
                status,
                payment_status,
                external_payment_id,
            } => info!(
                %order_id,
                %status,
                %payment_status,
                external_payment_id = external_payment_id.as_deref().unwrap_or("-"),
                "Order status changed"
            ),
            Event::StockDecremented {
                order_id,
                product_id,
                quantity,
            } => info!(%order_id, %product_id, quantity, "Stock decremented"),
            Event::CheckoutFailed {
                order_id,
                error_code,
            } => warn!(order_id = ?order_id, %error_code, "Checkout failed"),
            Event::WebhookIgnored { event_type, reason } => {
                info!(%event_type, %reason, "Webhook ignored")
            }
        }
    }

    info!("Event processing loop stopped");
}
