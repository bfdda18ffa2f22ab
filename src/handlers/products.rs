use axum::{
    extract::{Path, State},
    response::Response,
    routing::get,
    Router,
};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::handlers::common::success_response;
use crate::AppState;

/// Read-only catalog routes
pub fn products_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_products))
        .route("/:id", get(get_product))
}

async fn list_products(State(state): State<AppState>) -> Result<Response, ServiceError> {
    let products = state.products.list_active().await?;
    Ok(success_response(products))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let product = state
        .products
        .find_by_id(id)
        .await?
        .ok_or_else(|| ServiceError::ProductNotFound(id.to_string()))?;

    Ok(success_response(product))
}
