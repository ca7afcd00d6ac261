//! Entitlement checks. The entitlements table is the sole access
//! authority; this endpoint never falls back to purchases directly.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn check_entitlement(
    State(state): State<AppState>,
    Path((user_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entitled = state
        .reconcile
        .materializer()
        .has_entitlement(user_id, item_id)
        .await?;

    Ok(Json(json!({
        "user_id": user_id,
        "item_id": item_id,
        "entitled": entitled,
    })))
}
