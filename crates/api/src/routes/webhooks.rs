//! Payment processor webhook endpoint
//!
//! Unauthenticated; trust comes from the signature. Duplicates are a
//! success with a distinguishing body, never an error, so the processor's
//! redelivery loop settles.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use carmr_billing::WebhookOutcome;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let Some(signature) = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    else {
        return Err(ApiError::Validation(
            "Missing stripe-signature header".to_string(),
        ));
    };

    let envelope = state.billing.webhooks.verify_event(&body, signature)?;
    let outcome = state.billing.webhooks.handle_event(envelope).await?;

    Ok(Json(match outcome {
        WebhookOutcome::Processed => WebhookAck {
            received: true,
            duplicate: None,
        },
        WebhookOutcome::Duplicate => WebhookAck {
            received: true,
            duplicate: Some(true),
        },
    }))
}
