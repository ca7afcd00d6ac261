//! Membership tier lookup. Users with no membership row read as free.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn get_membership(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tier = state.reconcile.membership().current_tier(user_id).await?;

    Ok(Json(json!({
        "user_id": user_id,
        "tier": tier.as_str(),
    })))
}
