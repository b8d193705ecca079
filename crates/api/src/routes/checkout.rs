//! Checkout session handler

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;

use carmr_billing::{CheckoutResponse, Plan};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub plan_name: String,
}

pub async fn create_checkout_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let plan: Plan = body
        .plan_name
        .parse()
        .map_err(|_| ApiError::Validation("Invalid plan".to_string()))?;

    let response = state
        .billing
        .checkout
        .create_session(user.user_id, plan)
        .await?;

    Ok(Json(response))
}
