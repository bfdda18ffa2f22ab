use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::repositories::{OrderRepository, OrderTransition, OrderWithItems};
use crate::services::gateway::GatewayStatus;
use crate::services::pricing::to_minor_units;
use crate::services::publish_status_update;
use crate::services::signature::verify_event_checksum;

pub const TRANSACTION_UPDATED: &str = "transaction.updated";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSignature {
    pub checksum: String,
    #[serde(default)]
    pub properties: Vec<String>,
}

/// Inbound gateway notification. `data` stays untyped so the signed
/// property paths can be resolved against it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub signature: Option<EventSignature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventTransaction {
    pub id: String,
    pub status: GatewayStatus,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub amount_in_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<bool>,
}

impl WebhookAck {
    fn ignored() -> Self {
        Self {
            received: true,
            processed: None,
        }
    }

    fn processed(processed: bool) -> Self {
        Self {
            received: true,
            processed: Some(processed),
        }
    }
}

/// Renders the value at a dotted path (`transaction.status`) the way the
/// gateway concatenates it for checksums.
fn property_value(data: &Value, path: &str) -> String {
    let found = path
        .split('.')
        .try_fold(data, |node, key| node.get(key));
    match found {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// How inbound events are authenticated
#[derive(Clone)]
pub enum EventVerification {
    /// Recompute the checksum with the shared events secret
    Checksum(String),
    /// Accept unsigned events; development only
    Unverified,
    /// No secret outside development: nothing is trusted
    RejectAll,
}

impl EventVerification {
    pub fn from_config(config: &AppConfig) -> Self {
        match config.gateway.webhook_secret() {
            Some(secret) => Self::Checksum(secret.to_string()),
            None if config.is_development() => Self::Unverified,
            None => Self::RejectAll,
        }
    }
}

/// Result of matching an event against its order
enum Applied {
    Reconciled,
    UnknownOrder,
    AmountMismatch,
}

/// Applies asynchronous gateway results to local orders.
#[derive(Clone)]
pub struct ReconciliationService {
    orders: OrderRepository,
    events: EventSender,
    verification: EventVerification,
}

impl ReconciliationService {
    pub fn new(
        orders: OrderRepository,
        events: EventSender,
        verification: EventVerification,
    ) -> Self {
        Self {
            orders,
            events,
            verification,
        }
    }

    /// Never fails: the gateway only needs to know the event was received.
    #[instrument(skip(self, event), fields(event_type = %event.event))]
    pub async fn handle_event(&self, event: GatewayEvent) -> WebhookAck {
        if event.event != TRANSACTION_UPDATED {
            debug!("Ignoring unsupported gateway event");
            self.ignore(&event.event, "unsupported event type").await;
            return WebhookAck::ignored();
        }

        if !self.authentic(&event) {
            warn!("Rejecting unauthenticated gateway event");
            self.ignore(&event.event, "failed authentication").await;
            return WebhookAck::processed(false);
        }

        let transaction = match event
            .data
            .get("transaction")
            .cloned()
            .map(serde_json::from_value::<EventTransaction>)
        {
            Some(Ok(transaction)) => transaction,
            Some(Err(err)) => {
                warn!(error = %err, "Malformed transaction payload");
                self.ignore(&event.event, "malformed transaction").await;
                return WebhookAck::processed(false);
            }
            None => {
                self.ignore(&event.event, "missing transaction").await;
                return WebhookAck::processed(false);
            }
        };

        match self.apply(&transaction).await {
            Ok(Applied::Reconciled) => {
                counter!("webhook_events_total", 1, "result" => "applied");
                WebhookAck::processed(true)
            }
            Ok(Applied::UnknownOrder) => {
                counter!("webhook_events_total", 1, "result" => "unknown_order");
                self.ignore(&event.event, "no matching order").await;
                WebhookAck::processed(false)
            }
            Ok(Applied::AmountMismatch) => {
                counter!("webhook_events_total", 1, "result" => "amount_mismatch");
                self.ignore(&event.event, "amount mismatch").await;
                WebhookAck::processed(false)
            }
            Err(err) => {
                counter!("webhook_events_total", 1, "result" => "error");
                error!(
                    transaction_id = %transaction.id,
                    error = %err,
                    "Failed to reconcile gateway event"
                );
                WebhookAck::processed(false)
            }
        }
    }

    fn authentic(&self, event: &GatewayEvent) -> bool {
        let secret = match &self.verification {
            EventVerification::Checksum(secret) => secret,
            EventVerification::Unverified => return true,
            EventVerification::RejectAll => return false,
        };
        let (Some(signature), Some(timestamp)) = (&event.signature, event.timestamp) else {
            return false;
        };

        let values: Vec<String> = signature
            .properties
            .iter()
            .map(|path| property_value(&event.data, path))
            .collect();
        verify_event_checksum(&signature.checksum, &values, timestamp, secret)
    }

    /// Locates the order by gateway id first, then by merchant reference for
    /// transactions started from a hosted session.
    async fn locate(
        &self,
        transaction: &EventTransaction,
    ) -> Result<Option<OrderWithItems>, ServiceError> {
        if let Some(order) = self
            .orders
            .find_by_external_payment_id(&transaction.id)
            .await?
        {
            return Ok(Some(order));
        }

        let Some(reference) = transaction.reference.as_deref() else {
            return Ok(None);
        };
        let order = self.orders.find_by_order_number(reference).await?;

        // An order already bound to another transaction is not ours to move.
        Ok(order.filter(|o| o.order.external_payment_id.is_none()))
    }

    async fn apply(&self, transaction: &EventTransaction) -> Result<Applied, ServiceError> {
        let Some(order) = self.locate(transaction).await? else {
            warn!(transaction_id = %transaction.id, "No order for gateway transaction");
            return Ok(Applied::UnknownOrder);
        };

        if let Some(amount) = transaction.amount_in_cents {
            let expected = to_minor_units(order.order.total)?;
            if amount != expected {
                warn!(
                    order_id = %order.order.id,
                    expected,
                    reported = amount,
                    "Gateway amount differs from order total; leaving the order untouched"
                );
                return Ok(Applied::AmountMismatch);
            }
        }

        let update = self
            .orders
            .update_status(
                order.order.id,
                OrderTransition::new(transaction.status.resolve(), Some(transaction.id.clone())),
            )
            .await?;
        publish_status_update(&self.events, &update).await;

        info!(
            order_id = %update.order.order.id,
            gateway_status = %transaction.status,
            changed = update.changed,
            "Gateway event reconciled"
        );
        Ok(Applied::Reconciled)
    }

    async fn ignore(&self, event_type: &str, reason: &str) {
        self.events
            .send_or_log(Event::WebhookIgnored {
                event_type: event_type.to_string(),
                reason: reason.to_string(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn property_paths_resolve_against_data() {
        let data = json!({"transaction": {"id": "t-1", "amount_in_cents": 2480000, "status": "APPROVED", "x": null}});
        assert_eq!(property_value(&data, "transaction.id"), "t-1");
        assert_eq!(property_value(&data, "transaction.amount_in_cents"), "2480000");
        assert_eq!(property_value(&data, "transaction.x"), "");
        assert_eq!(property_value(&data, "transaction.missing"), "");
    }

    #[test]
    fn event_deserializes_without_signature() {
        let event: GatewayEvent = serde_json::from_value(json!({
            "event": "transaction.updated",
            "data": {"transaction": {"id": "t-1", "status": "DECLINED", "reference": "ORDER_x"}}
        }))
        .unwrap();
        assert!(event.signature.is_none());
        let tx: EventTransaction =
            serde_json::from_value(event.data["transaction"].clone()).unwrap();
        assert_eq!(tx.status, GatewayStatus::Declined);
        assert_eq!(tx.reference.as_deref(), Some("ORDER_x"));
    }

    #[test]
    fn verification_follows_environment_and_secret() {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            3000,
            "production".into(),
        );
        assert!(matches!(
            EventVerification::from_config(&cfg),
            EventVerification::RejectAll
        ));

        cfg.gateway.events_secret = Some("events".into());
        assert!(matches!(
            EventVerification::from_config(&cfg),
            EventVerification::Checksum(secret) if secret == "events"
        ));

        cfg.gateway.events_secret = None;
        cfg.environment = "development".into();
        assert!(matches!(
            EventVerification::from_config(&cfg),
            EventVerification::Unverified
        ));
    }

    #[test]
    fn ack_serialization() {
        assert_eq!(
            serde_json::to_value(WebhookAck::ignored()).unwrap(),
            json!({"received": true})
        );
        assert_eq!(
            serde_json::to_value(WebhookAck::processed(true)).unwrap(),
            json!({"received": true, "processed": true})
        );
    }
}
