mod common;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use serde_json::Value;
use uuid::Uuid;

use checkout_api::entities::{OrderStatus, PaymentStatus};
use checkout_api::errors::ServiceError;
use checkout_api::services::checkout::{CheckoutRequest, TokenizedCheckoutRequest};
use checkout_api::services::reconciliation::GatewayEvent;
use checkout_api::services::signature::{verify_integrity_signature, SignaturePayload};
use common::{checkout_body, transaction, transaction_event, TestApp, INTEGRITY_SECRET};

fn checkout_request(product_id: Uuid, quantity: i32) -> CheckoutRequest {
    serde_json::from_value(checkout_body(product_id, quantity)).expect("valid checkout request")
}

fn gateway_event(value: Value) -> GatewayEvent {
    serde_json::from_value(value).expect("valid gateway event")
}

#[tokio::test]
async fn server_side_pricing_drives_the_gateway_amount() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(100000), 10).await;
    app.gateway
        .on_create(Ok(transaction("tx-a", "APPROVED")));

    let outcome = app
        .state
        .checkout
        .process(checkout_request(product.id, 2))
        .await
        .expect("checkout runs");

    let request = app.gateway.last_request().expect("transaction created");
    assert_eq!(request.amount_in_cents, 24_800_000);
    assert_eq!(request.currency, "COP");
    assert_eq!(request.customer_email, "ana@example.com");
    assert!(request.reference.starts_with("ORDER_"));
    assert!(verify_integrity_signature(
        &request.signature,
        &SignaturePayload::new(&request.reference, 24_800_000, "COP"),
        INTEGRITY_SECRET,
    ));

    let order = app
        .state
        .orders
        .find_by_id(outcome.order_id.expect("order id"))
        .await
        .unwrap()
        .expect("order persisted");
    assert_eq!(order.order.order_number, request.reference);
    assert_eq!(order.order.subtotal, dec!(200000));
    assert_eq!(order.order.base_fee, dec!(3000));
    assert_eq!(order.order.shipping_fee, dec!(7000));
    assert_eq!(order.order.tax, dec!(38000));
    assert_eq!(order.order.total, dec!(248000));
    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].quantity, 2);
    assert_eq!(order.shipping_address.city, "Bogotá");

    let card = app.gateway.cards.lock().unwrap()[0].clone();
    assert_eq!(card.number, "4242424242424242");
    assert_eq!(card.card_holder, "Ana Pérez");
}

#[tokio::test]
async fn out_of_stock_product_is_rejected_before_any_order() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(50000), 0).await;

    let result = app
        .state
        .checkout
        .process(checkout_request(product.id, 1))
        .await;

    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    assert_eq!(app.order_count().await, 0);
    assert!(app.gateway.last_request().is_none());
    assert!(app.gateway.cards.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_and_inactive_products_are_rejected() {
    let app = TestApp::new().await;
    let inactive = app.seed_product_with(dec!(50000), 5, false).await;

    assert_matches!(
        app.state
            .checkout
            .process(checkout_request(Uuid::new_v4(), 1))
            .await,
        Err(ServiceError::ProductNotFound(_))
    );
    assert_matches!(
        app.state
            .checkout
            .process(checkout_request(inactive.id, 1))
            .await,
        Err(ServiceError::ProductInactive(_))
    );
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn synchronous_approval_confirms_and_decrements_once() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(100000), 10).await;
    app.gateway.on_create(Ok(transaction("tx-c", "APPROVED")));

    let outcome = app
        .state
        .checkout
        .process(checkout_request(product.id, 2))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.status.as_deref(), Some("APPROVED"));
    assert_eq!(outcome.transaction_id.as_deref(), Some("tx-c"));
    assert_eq!(outcome.order_status, Some(OrderStatus::Confirmed));
    assert_eq!(outcome.payment_status, Some(PaymentStatus::Approved));
    assert_eq!(app.gateway.poll_count(), 0);
    assert_eq!(app.stock_of(product.id).await, 8);

    // Redelivered webhook for the same outcome changes nothing
    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(transaction_event("tx-c", "APPROVED", None)))
        .await;
    assert!(ack.received);
    assert_eq!(ack.processed, Some(true));
    assert_eq!(app.stock_of(product.id).await, 8);

    let order = app
        .state
        .orders
        .find_by_external_payment_id("tx-c")
        .await
        .unwrap()
        .expect("order linked to transaction");
    assert_eq!(order.order.status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn pending_then_webhook_approval_decrements_exactly_once() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(100000), 10).await;
    app.gateway
        .on_create(Ok(transaction("tx-d", "PENDING")))
        .on_poll(Ok(transaction("tx-d", "PENDING")));

    let outcome = app
        .state
        .checkout
        .process(checkout_request(product.id, 3))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.payment_status, Some(PaymentStatus::Pending));
    assert_eq!(outcome.message.as_deref(), Some("Payment pending"));
    assert_eq!(app.gateway.poll_count(), 1);
    assert_eq!(app.stock_of(product.id).await, 10);

    let event = transaction_event("tx-d", "APPROVED", None);
    for _ in 0..3 {
        let ack = app
            .state
            .reconciliation
            .handle_event(gateway_event(event.clone()))
            .await;
        assert_eq!(ack.processed, Some(true));
    }

    let order = app
        .state
        .orders
        .find_by_id(outcome.order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.order.status, OrderStatus::Confirmed);
    assert_eq!(order.order.payment_status, PaymentStatus::Approved);
    assert_eq!(app.stock_of(product.id).await, 7);
}

#[tokio::test]
async fn webhook_for_unknown_transaction_is_acknowledged_without_changes() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(100000), 10).await;
    app.gateway
        .on_create(Ok(transaction("tx-known", "PENDING")))
        .on_poll(Ok(transaction("tx-known", "PENDING")));
    let outcome = app
        .state
        .checkout
        .process(checkout_request(product.id, 1))
        .await
        .unwrap();

    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(transaction_event(
            "tx-nobody",
            "APPROVED",
            Some("ORDER_does-not-exist"),
        )))
        .await;

    assert!(ack.received);
    assert_eq!(ack.processed, Some(false));
    assert_eq!(app.order_count().await, 1);
    let order = app
        .state
        .orders
        .find_by_id(outcome.order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.order.external_payment_id.as_deref(), Some("tx-known"));
    assert_eq!(app.stock_of(product.id).await, 10);
}

#[tokio::test]
async fn non_transaction_events_are_ignored() {
    let app = TestApp::new().await;
    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(serde_json::json!({
            "event": "nequi_token.updated",
            "data": {}
        })))
        .await;
    assert!(ack.received);
    assert_eq!(ack.processed, None);
}

#[tokio::test]
async fn declined_payment_cancels_and_late_approval_is_ignored() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(45000), 4).await;
    app.gateway.on_create(Ok(transaction("tx-x", "DECLINED")));

    let outcome = app
        .state
        .checkout
        .process(checkout_request(product.id, 1))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.order_status, Some(OrderStatus::Cancelled));
    assert_eq!(outcome.payment_status, Some(PaymentStatus::Rejected));
    assert_eq!(outcome.message.as_deref(), Some("Payment declined"));

    app.state
        .reconciliation
        .handle_event(gateway_event(transaction_event("tx-x", "APPROVED", None)))
        .await;

    let order = app
        .state
        .orders
        .find_by_id(outcome.order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.order.status, OrderStatus::Cancelled);
    assert_eq!(order.order.payment_status, PaymentStatus::Rejected);
    assert_eq!(app.stock_of(product.id).await, 4);
}

#[tokio::test]
async fn tokenization_failure_leaves_pending_order_behind() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(45000), 4).await;
    app.gateway.on_tokenize(Err(ServiceError::GatewayValidationError(
        "number: Número de tarjeta inválido".to_string(),
    )));

    let outcome = app
        .state
        .checkout
        .process(checkout_request(product.id, 1))
        .await
        .expect("post-order failures are outcomes, not errors");

    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("gateway_validation_error"));
    assert!(outcome
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Número de tarjeta inválido"));
    assert!(app.gateway.last_request().is_none());

    let order = app
        .state
        .orders
        .find_by_id(outcome.order_id.expect("order was created"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.order.status, OrderStatus::Pending);
    assert_eq!(order.order.external_payment_id, None);
}

#[tokio::test]
async fn failed_poll_keeps_order_pending_with_transaction_attached() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(45000), 4).await;
    app.gateway.on_create(Ok(transaction("tx-p", "PENDING")));

    let outcome = app
        .state
        .checkout
        .process(checkout_request(product.id, 1))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.transaction_id.as_deref(), Some("tx-p"));
    assert_eq!(outcome.payment_status, Some(PaymentStatus::Pending));
    assert_eq!(app.gateway.poll_count(), 1);
    assert!(app
        .state
        .orders
        .find_by_external_payment_id("tx-p")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn webhook_racing_the_poll_decrements_once() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(100000), 5).await;
    let gate = app.gateway.gate_polls();
    app.gateway
        .on_create(Ok(transaction("tx-race", "PENDING")))
        .on_poll(Ok(transaction("tx-race", "APPROVED")));

    let checkout = app.state.checkout.clone();
    let request = checkout_request(product.id, 2);
    let running = tokio::spawn(async move { checkout.process(request).await });

    app.gateway.created.notified().await;
    let reference = app.gateway.last_request().unwrap().reference;

    // The order has no transaction id yet; the reference finds it
    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(transaction_event(
            "tx-race",
            "APPROVED",
            Some(&reference),
        )))
        .await;
    assert_eq!(ack.processed, Some(true));
    assert_eq!(app.stock_of(product.id).await, 3);

    gate.notify_one();
    let outcome = running.await.unwrap().unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.payment_status, Some(PaymentStatus::Approved));
    assert_eq!(app.stock_of(product.id).await, 3);
}

#[tokio::test]
async fn approval_without_stock_left_is_rolled_back() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(100000), 1).await;
    for id in ["tx-1", "tx-2"] {
        app.gateway
            .on_create(Ok(transaction(id, "PENDING")))
            .on_poll(Ok(transaction(id, "PENDING")));
    }

    let first = app
        .state
        .checkout
        .process(checkout_request(product.id, 1))
        .await
        .unwrap();
    let second = app
        .state
        .checkout
        .process(checkout_request(product.id, 1))
        .await
        .unwrap();

    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(transaction_event("tx-1", "APPROVED", None)))
        .await;
    assert_eq!(ack.processed, Some(true));

    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(transaction_event("tx-2", "APPROVED", None)))
        .await;
    assert_eq!(ack.processed, Some(false));

    assert_eq!(app.stock_of(product.id).await, 0);
    let confirmed = app
        .state
        .orders
        .find_by_id(first.order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let stuck = app
        .state
        .orders
        .find_by_id(second.order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmed.order.payment_status, PaymentStatus::Approved);
    assert_eq!(stuck.order.status, OrderStatus::Pending);
    assert_eq!(stuck.order.payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn checksum_is_enforced_when_events_secret_is_configured() {
    use checkout_api::services::signature::event_checksum;

    let app = TestApp::with_config(|cfg| {
        cfg.gateway.events_secret = Some("test_events_secret".to_string());
    })
    .await;
    let product = app.seed_product(dec!(100000), 5).await;
    app.gateway
        .on_create(Ok(transaction("tx-sig", "PENDING")))
        .on_poll(Ok(transaction("tx-sig", "PENDING")));
    app.state
        .checkout
        .process(checkout_request(product.id, 1))
        .await
        .unwrap();

    let mut event = transaction_event("tx-sig", "APPROVED", None);
    let properties = vec!["transaction.id".to_string(), "transaction.status".to_string()];
    event["signature"] = serde_json::json!({
        "checksum": "0".repeat(64),
        "properties": properties,
    });

    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(event.clone()))
        .await;
    assert_eq!(ack.processed, Some(false));
    assert_eq!(app.stock_of(product.id).await, 5);

    let checksum = event_checksum(
        &["tx-sig".to_string(), "APPROVED".to_string()],
        1_700_000_000,
        "test_events_secret",
    );
    event["signature"]["checksum"] = serde_json::json!(checksum.to_uppercase());

    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(event))
        .await;
    assert_eq!(ack.processed, Some(true));
    assert_eq!(app.stock_of(product.id).await, 4);
}

#[tokio::test]
async fn unsigned_events_are_refused_outside_development() {
    let app = TestApp::with_config(|cfg| {
        cfg.environment = "production".to_string();
        cfg.gateway.events_secret = None;
    })
    .await;
    let product = app.seed_product(dec!(100000), 5).await;
    app.gateway
        .on_create(Ok(transaction("tx-real", "PENDING")))
        .on_poll(Ok(transaction("tx-real", "PENDING")));
    let outcome = app
        .state
        .checkout
        .process(checkout_request(product.id, 2))
        .await
        .unwrap();
    assert_eq!(outcome.payment_status, Some(PaymentStatus::Pending));

    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(transaction_event("tx-real", "APPROVED", None)))
        .await;

    assert_eq!(ack.processed, Some(false));
    assert_eq!(app.stock_of(product.id).await, 5);
    let order = app
        .state
        .orders
        .find_by_external_payment_id("tx-real")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.order.status, OrderStatus::Pending);
    assert_eq!(order.order.payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn event_amount_must_match_the_order_total() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(100000), 5).await;
    app.gateway
        .on_create(Ok(transaction("tx-amount", "PENDING")))
        .on_poll(Ok(transaction("tx-amount", "PENDING")));
    app.state
        .checkout
        .process(checkout_request(product.id, 1))
        .await
        .unwrap();

    let mut event = transaction_event("tx-amount", "APPROVED", None);
    event["data"]["transaction"]["amount_in_cents"] = serde_json::json!(100);
    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(event.clone()))
        .await;
    assert_eq!(ack.processed, Some(false));
    assert_eq!(app.stock_of(product.id).await, 5);

    event["data"]["transaction"]["amount_in_cents"] = serde_json::json!(12_900_000);
    let ack = app
        .state
        .reconciliation
        .handle_event(gateway_event(event))
        .await;
    assert_eq!(ack.processed, Some(true));
    assert_eq!(app.stock_of(product.id).await, 4);
}

fn tokenized_request(product_id: Uuid, quantity: i32, token: &str) -> TokenizedCheckoutRequest {
    serde_json::from_value(serde_json::json!({
        "productId": product_id.to_string(),
        "quantity": quantity,
        "customerEmail": "ana@example.com",
        "paymentToken": token,
        "shippingAddress": {
            "street": "Calle 1 # 2-3",
            "city": "Medellín",
            "postalCode": "050001",
            "country": "CO",
            "phone": "3001234567"
        }
    }))
    .expect("valid tokenized request")
}

#[tokio::test]
async fn tokenized_checkout_skips_card_tokenization() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(100000), 5).await;
    app.gateway
        .on_create(Ok(transaction("tx-tok", "PENDING")))
        .on_poll(Ok(transaction("tx-tok", "APPROVED")));

    let outcome = app
        .state
        .checkout
        .process_tokenized(tokenized_request(product.id, 2, "tok_browser_1"))
        .await
        .expect("checkout runs");

    assert!(outcome.success);
    assert_eq!(outcome.payment_status, Some(PaymentStatus::Approved));
    assert!(app.gateway.cards.lock().unwrap().is_empty());
    assert_eq!(app.gateway.poll_count(), 1);

    let request = app.gateway.last_request().expect("transaction created");
    assert_eq!(request.payment_token, "tok_browser_1");
    assert_eq!(request.amount_in_cents, 24_800_000);
    assert!(verify_integrity_signature(
        &request.signature,
        &SignaturePayload::new(&request.reference, 24_800_000, "COP"),
        INTEGRITY_SECRET,
    ));

    let order = app
        .state
        .orders
        .find_by_id(outcome.order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.order.customer_email, "ana@example.com");
    assert_eq!(order.shipping_address.region.as_deref(), Some("Medellín"));
    assert_eq!(order.shipping_address.phone.as_deref(), Some("3001234567"));
    assert_eq!(app.stock_of(product.id).await, 3);
}

#[tokio::test]
async fn tokenized_checkout_checks_preconditions_before_persisting() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(100000), 1).await;

    let result = app
        .state
        .checkout
        .process_tokenized(tokenized_request(product.id, 2, "tok_browser_2"))
        .await;

    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    assert_eq!(app.order_count().await, 0);
    assert!(app.gateway.last_request().is_none());
}
