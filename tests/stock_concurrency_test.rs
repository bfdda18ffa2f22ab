mod common;

use std::sync::Arc;

use futures::future::join_all;
use rust_decimal_macros::dec;

use checkout_api::entities::PaymentStatus;
use checkout_api::repositories::ProductRepository;
use checkout_api::services::reconciliation::GatewayEvent;
use common::{checkout_body, transaction, transaction_event, TestApp};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_decrements_never_oversell() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(1000), 10).await;

    let tasks = (0..20).map(|_| {
        let db = Arc::clone(&app.state.db);
        let product_id = product.id;
        tokio::spawn(async move {
            ProductRepository::decrement_stock(&*db, product_id, 1)
                .await
                .is_ok()
        })
    });

    let successes = join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count();

    assert_eq!(successes, 10);
    assert_eq!(app.stock_of(product.id).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_respect_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(1000), 5).await;

    let mut transaction_ids = Vec::new();
    for i in 0..8 {
        let id = format!("tx-{}", i);
        app.gateway
            .on_create(Ok(transaction(&id, "PENDING")))
            .on_poll(Ok(transaction(&id, "PENDING")));
        transaction_ids.push(id);
    }
    for _ in 0..8 {
        let request = serde_json::from_value(checkout_body(product.id, 1)).unwrap();
        let outcome = app.state.checkout.process(request).await.unwrap();
        assert_eq!(outcome.payment_status, Some(PaymentStatus::Pending));
    }

    let tasks = transaction_ids.iter().map(|id| {
        let reconciliation = app.state.reconciliation.clone();
        let event: GatewayEvent =
            serde_json::from_value(transaction_event(id, "APPROVED", None)).unwrap();
        tokio::spawn(async move { reconciliation.handle_event(event).await })
    });

    let processed = join_all(tasks)
        .await
        .into_iter()
        .filter(|ack| matches!(ack, Ok(a) if a.processed == Some(true)))
        .count();

    assert_eq!(processed, 5);
    assert_eq!(app.stock_of(product.id).await, 0);

    let mut approved = 0;
    for id in &transaction_ids {
        let order = app
            .state
            .orders
            .find_by_external_payment_id(id)
            .await
            .unwrap()
            .unwrap();
        if order.order.payment_status == PaymentStatus::Approved {
            approved += 1;
        }
    }
    assert_eq!(approved, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_with_ample_stock_all_apply() {
    let app = TestApp::with_config(|cfg| cfg.db_max_connections = 8).await;
    let product = app.seed_product(dec!(1000), 20).await;

    let mut transaction_ids = Vec::new();
    for i in 0..8 {
        let id = format!("tx-ample-{}", i);
        app.gateway
            .on_create(Ok(transaction(&id, "PENDING")))
            .on_poll(Ok(transaction(&id, "PENDING")));
        transaction_ids.push(id);
    }
    for _ in 0..8 {
        let request = serde_json::from_value(checkout_body(product.id, 1)).unwrap();
        app.state.checkout.process(request).await.unwrap();
    }

    let tasks = transaction_ids.iter().map(|id| {
        let reconciliation = app.state.reconciliation.clone();
        let event: GatewayEvent =
            serde_json::from_value(transaction_event(id, "APPROVED", None)).unwrap();
        tokio::spawn(async move { reconciliation.handle_event(event).await })
    });

    let processed = join_all(tasks)
        .await
        .into_iter()
        .filter(|ack| matches!(ack, Ok(a) if a.processed == Some(true)))
        .count();

    assert_eq!(processed, 8);
    assert_eq!(app.stock_of(product.id).await, 12);
}

#[tokio::test]
async fn duplicate_deliveries_decrement_once() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(1000), 10).await;
    app.gateway
        .on_create(Ok(transaction("tx-dup", "PENDING")))
        .on_poll(Ok(transaction("tx-dup", "PENDING")));
    let request = serde_json::from_value(checkout_body(product.id, 4)).unwrap();
    app.state.checkout.process(request).await.unwrap();

    let tasks = (0..10).map(|_| {
        let reconciliation = app.state.reconciliation.clone();
        let event: GatewayEvent =
            serde_json::from_value(transaction_event("tx-dup", "APPROVED", None)).unwrap();
        tokio::spawn(async move { reconciliation.handle_event(event).await })
    });
    join_all(tasks).await;

    assert_eq!(app.stock_of(product.id).await, 6);
}
