//! Route registration.

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

mod admin;
mod entitlements;
mod memberships;
mod purchases;
mod webhooks;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/purchases/verify", post(purchases::verify_purchase))
        .route(
            "/entitlements/{user_id}/{item_id}",
            get(entitlements::check_entitlement),
        )
        .route(
            "/memberships/{user_id}",
            get(memberships::get_membership),
        )
        .route("/admin/events/failed", get(admin::list_failed_events))
        .route("/admin/events/{event_id}", get(admin::get_event))
        .route("/admin/events/replay", post(admin::replay_failed_events))
        .route("/admin/maintenance/sweep", post(admin::maintenance_sweep))
        .with_state(state)
}

/// Liveness plus a database round trip.
async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(makerbox_reconcile::ReconcileError::from)?;
    Ok(Json(json!({ "status": "ok" })))
}
