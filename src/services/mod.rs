pub mod checkout;
pub mod gateway;
pub mod pricing;
pub mod reconciliation;
pub mod signature;

use crate::events::{Event, EventSender};
use crate::repositories::StatusUpdate;

/// Emits the events that follow a committed status update. No-op updates
/// emit nothing.
pub(crate) async fn publish_status_update(events: &EventSender, update: &StatusUpdate) {
    if !update.changed {
        return;
    }

    let order = &update.order.order;
    events
        .send_or_log(Event::OrderStatusChanged {
            order_id: order.id,
            status: order.status,
            payment_status: order.payment_status,
            external_payment_id: order.external_payment_id.clone(),
        })
        .await;

    if update.stock_decremented {
        for item in &update.order.items {
            events
                .send_or_log(Event::StockDecremented {
                    order_id: order.id,
                    product_id: item.product_id,
                    quantity: item.quantity,
                })
                .await;
        }
    }
}
