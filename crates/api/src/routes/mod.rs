//! Route handlers and router assembly

pub mod checkout;
pub mod entitlements;
pub mod reports;
pub mod webhooks;

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::auth::require_auth;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let protected = Router::new()
        .route("/api/vin", post(reports::lookup_vin))
        .route("/api/plate", post(reports::lookup_plate))
        .route("/api/reports/{id}", get(reports::get_report))
        .route("/api/checkout", post(checkout::create_checkout_session))
        .route("/api/entitlements", get(entitlements::get_entitlements))
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(protected)
        .with_state(state)
}

async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
