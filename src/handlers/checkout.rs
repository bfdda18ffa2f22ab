use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tracing::info;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::handlers::common::{created_response, success_response};
use crate::services::checkout::{
    CheckoutOutcome, CheckoutRequest, CheckoutSessionRequest, TokenizedCheckoutRequest,
};
use crate::AppState;

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(process_checkout))
        .route("/sessions", post(create_session))
        .route("/transactions", post(create_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route(
            "/transactions/payment/:payment_id",
            get(get_transaction_by_payment_id),
        )
}

/// Runs a card checkout. Requests rejected before an order exists answer
/// with the error's status; every later outcome is a 200 whose body says
/// whether the payment went through.
async fn process_checkout(
    State(state): State<AppState>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejected(malformed_body(rejection)),
    };
    match state.checkout.process(payload).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => rejected(err),
    }
}

/// Checkout with a card token obtained by the browser. Answers 201 once the
/// order exists, whatever the payment outcome.
async fn create_transaction(
    State(state): State<AppState>,
    payload: Result<Json<TokenizedCheckoutRequest>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejected(malformed_body(rejection)),
    };
    match state.checkout.process_tokenized(payload).await {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(err) => rejected(err),
    }
}

fn malformed_body(rejection: JsonRejection) -> ServiceError {
    ServiceError::ValidationError(rejection.body_text())
}

fn rejected(err: ServiceError) -> Response {
    info!(code = err.code(), "Checkout rejected before order creation");
    let body = CheckoutOutcome {
        success: false,
        error: Some(err.response_message()),
        error_code: Some(err.code().to_string()),
        ..Default::default()
    };
    (err.status_code(), Json(body)).into_response()
}

/// Prices and signs a hosted-widget payment
async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CheckoutSessionRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let Json(payload) = payload.map_err(malformed_body)?;
    let session = state.checkout.create_session(payload).await?;
    Ok(created_response(session))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let order = state
        .orders
        .find_by_id(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", id)))?;

    Ok(success_response(order))
}

async fn get_transaction_by_payment_id(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Response, ServiceError> {
    let order = state
        .orders
        .find_by_external_payment_id(&payment_id)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("No transaction for payment {}", payment_id))
        })?;

    Ok(success_response(order))
}
