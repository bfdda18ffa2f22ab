use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing HTTP endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable error code
    pub code: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Product {0} not found")]
    ProductNotFound(String),

    #[error("Product {0} is not available")]
    ProductInactive(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Gateway authentication error: {0}")]
    GatewayAuthError(String),

    #[error("Gateway validation error: {0}")]
    GatewayValidationError(String),

    #[error("Gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Store consistency error: {0}")]
    StoreConsistencyError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) | Self::StoreConsistencyError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::ProductNotFound(_) => StatusCode::NOT_FOUND,
            Self::ProductInactive(_) => StatusCode::CONFLICT,
            Self::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::GatewayAuthError(_)
            | Self::GatewayValidationError(_)
            | Self::GatewayRejected(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code, surfaced to clients next to the message
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::ValidationError(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::ProductNotFound(_) => "product_not_found",
            Self::ProductInactive(_) => "product_inactive",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::GatewayAuthError(_) => "gateway_auth_error",
            Self::GatewayValidationError(_) => "gateway_validation_error",
            Self::GatewayRejected(_) => "gateway_rejected",
            Self::GatewayUnavailable(_) => "gateway_unavailable",
            Self::StoreConsistencyError(_) => "store_consistency_error",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// True for failures of the remote payment leg
    pub fn is_gateway_error(&self) -> bool {
        matches!(
            self,
            Self::GatewayAuthError(_)
                | Self::GatewayValidationError(_)
                | Self::GatewayRejected(_)
                | Self::GatewayUnavailable(_)
        )
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            // Gateway credentials problems are an operator concern
            Self::GatewayAuthError(_) => "Payment gateway rejected our credentials".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            code: self.code().to_string(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
