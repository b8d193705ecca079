//! Report request handlers

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::lookup::{PlateQuery, Vin};
use crate::reports::{Report, ReportIdentifier, ReportOutcome};
use crate::state::AppState;

/// Requests per minute per identifier for the report endpoints
const REPORT_RATE_LIMIT: u32 = 10;

#[derive(Debug, Deserialize)]
pub struct VinRequest {
    pub vin: String,
}

#[derive(Debug, Deserialize)]
pub struct PlateRequest {
    pub plate: String,
    pub state: String,
}

/// First forwarded address, if any; used for audit rows only
pub(crate) fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        return forwarded.split(',').next().map(|s| s.trim().to_string());
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn enforce_rate_limit(state: &AppState, user: &AuthUser, endpoint: &str) -> ApiResult<()> {
    let key = format!("{endpoint}:user:{}", user.user_id);
    let result = state.rate_limiter.check(&key, REPORT_RATE_LIMIT).await;

    if !result.allowed {
        return Err(ApiError::RateLimited {
            retry_after_seconds: result.retry_after_seconds.unwrap_or(60),
        });
    }

    Ok(())
}

pub async fn lookup_vin(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Json(body): Json<VinRequest>,
) -> ApiResult<Json<ReportOutcome>> {
    enforce_rate_limit(&state, &user, "vin").await?;

    let vin = Vin::parse(&body.vin)?;
    let ip = client_ip(&headers);

    let outcome = state
        .reports
        .acquire(user.user_id, ReportIdentifier::Vin(vin), ip.as_deref())
        .await?;

    Ok(Json(outcome))
}

pub async fn lookup_plate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Json(body): Json<PlateRequest>,
) -> ApiResult<Json<ReportOutcome>> {
    enforce_rate_limit(&state, &user, "plate").await?;

    let plate = PlateQuery::parse(&body.plate, &body.state)?;
    let ip = client_ip(&headers);

    let outcome = state
        .reports
        .acquire(user.user_id, ReportIdentifier::Plate(plate), ip.as_deref())
        .await?;

    Ok(Json(outcome))
}

pub async fn get_report(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(report_id): Path<Uuid>,
) -> ApiResult<Json<Report>> {
    let report = state.reports.fetch(user.user_id, report_id).await?;
    Ok(Json(report))
}
