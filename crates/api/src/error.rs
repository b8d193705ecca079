//! API error types and response mapping
//!
//! The status-code taxonomy lives here so handlers can return domain
//! conditions and let the mapping decide the wire shape. Entitlement
//! exhaustion is a distinguished 402, not a generic failure, so clients
//! can branch straight to the purchase flow.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use carmr_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },

    #[error("{0}")]
    Validation(String),

    /// The user has no effective entitlement; a purchase is required
    #[error("no active entitlement")]
    PaymentRequired,

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, json!({ "error": message }))
            }
            ApiError::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "Rate limit exceeded",
                    "retryAfter": retry_after_seconds,
                }),
            ),
            ApiError::Validation(message) => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            ApiError::PaymentRequired => (
                StatusCode::PAYMENT_REQUIRED,
                json!({
                    "error": "No active entitlement",
                    "requiresPurchase": true,
                }),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": "Not found" })),
            ApiError::Billing(BillingError::SignatureInvalid) => {
                (StatusCode::BAD_REQUEST, json!({ "error": "Invalid signature" }))
            }
            ApiError::Billing(BillingError::UnsupportedPayload(message)) => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            ApiError::Billing(BillingError::Config(message)) => {
                tracing::error!(error = %message, "Billing misconfiguration");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            ApiError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            ApiError::Billing(e) => {
                tracing::error!(error = %e, "Billing error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
