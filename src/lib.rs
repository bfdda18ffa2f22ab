//! Checkout API library
//!
//! Order-and-payment orchestration for a single-product checkout: authoritative
//! pricing, pending order creation, card authorization through an external
//! gateway and reconciliation of the gateway's asynchronous result.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod repositories;
pub mod services;
pub mod tracing;

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use crate::repositories::{OrderRepository, ProductRepository};
use crate::services::checkout::{CheckoutService, CheckoutSettings};
use crate::services::gateway::PaymentGateway;
use crate::services::pricing::PriceCalculator;
use crate::services::reconciliation::{EventVerification, ReconciliationService};

/// Upper bound for a whole request, gateway round trips and re-poll included
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub checkout: CheckoutService,
    pub reconciliation: ReconciliationService,
    pub orders: OrderRepository,
    pub products: ProductRepository,
}

impl AppState {
    /// Wires repositories and services around a connection and a gateway.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: events::EventSender,
    ) -> Self {
        let orders = OrderRepository::new(db.clone());
        let products = ProductRepository::new(db.clone());

        let checkout = CheckoutService::new(
            products.clone(),
            orders.clone(),
            gateway,
            PriceCalculator::new(config.pricing.clone()),
            CheckoutSettings::from(&config.gateway),
            event_sender.clone(),
        );
        let reconciliation = ReconciliationService::new(
            orders.clone(),
            event_sender.clone(),
            EventVerification::from_config(&config),
        );

        Self {
            db,
            config,
            event_sender,
            checkout,
            reconciliation,
            orders,
            products,
        }
    }
}

// Common response wrappers
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        // Status and health endpoints
        .route("/status", get(api_status))
        .route("/health", get(health_check))
        .nest("/checkout", handlers::checkout::checkout_routes())
        .nest("/webhooks", handlers::webhooks::webhook_routes())
        .nest("/products", handlers::products::products_routes())
}

/// Full application router with the request-scoped middleware stack. CORS is
/// left to the binary since it depends on deployment configuration.
pub fn app_router(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/", get(|| async { "checkout-api up" }))
        .nest("/api/v1", api_v1_routes())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(axum::middleware::from_fn(
            middleware_helpers::security_headers_middleware,
        ))
        // HTTP tracing layer for consistent request/response telemetry
        .layer(crate::tracing::configure_http_tracing())
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id_middleware,
        ))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> ApiResult<Value> {
    let status_data = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "checkout-api",
        "environment": state.config.environment,
        "currency": state.config.pricing.currency,
        "gateway_configured": state.config.gateway.has_credentials(),
        "timestamp": Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(status_data)))
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    let db_status = match db::check_connection(&state.db).await {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };

    let health_data = json!({
        "status": db_status,
        "checks": {
            "database": db_status,
        },
        "timestamp": Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(health_data)))
}
