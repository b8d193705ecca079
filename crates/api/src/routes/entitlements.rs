//! Entitlement summary handler

use axum::extract::State;
use axum::{Extension, Json};

use carmr_billing::EntitlementSummary;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn get_entitlements(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<EntitlementSummary>> {
    let summary = state.billing.entitlements.summary(user.user_id).await?;
    Ok(Json(summary))
}
