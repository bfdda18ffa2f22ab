use axum::{
    extract::{rejection::JsonRejection, Json, State},
    routing::post,
    Router,
};
use tracing::warn;

use crate::services::reconciliation::{GatewayEvent, WebhookAck};
use crate::AppState;

/// Webhook routes. Unauthenticated; authenticity comes from the event
/// checksum when an events secret is configured.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/gateway", post(gateway_webhook))
}

/// Always acknowledges so the gateway stops retrying; the body reports
/// whether the event changed anything.
async fn gateway_webhook(
    State(state): State<AppState>,
    payload: Result<Json<GatewayEvent>, JsonRejection>,
) -> Json<WebhookAck> {
    match payload {
        Ok(Json(event)) => Json(state.reconciliation.handle_event(event).await),
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Unreadable gateway webhook body");
            Json(WebhookAck {
                received: true,
                processed: Some(false),
            })
        }
    }
}
