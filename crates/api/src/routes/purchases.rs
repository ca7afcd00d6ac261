//! Client-initiated purchase verification.
//!
//! Called by the frontend after checkout redirect. The session id is the
//! only thing taken from the client; payment state is re-fetched from the
//! provider before anything is granted.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use makerbox_reconcile::ClientVerification;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VerifyPurchaseRequest {
    pub session_id: String,
    /// Optional item hint; provider metadata wins when both are present.
    pub item_id: Option<Uuid>,
}

pub async fn verify_purchase(
    State(state): State<AppState>,
    Json(req): Json<VerifyPurchaseRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .reconcile
        .verify_client_session(&req.session_id, req.item_id)
        .await?;

    let body = match outcome {
        ClientVerification::Completed { purchase_id } => json!({
            "status": "completed",
            "purchase_id": purchase_id,
        }),
        ClientVerification::AccessPending => json!({
            "status": "access_pending",
            "detail": "payment confirmed; access is being reconciled",
        }),
        ClientVerification::NotPaid => json!({
            "status": "not_paid",
        }),
    };
    Ok(Json(body))
}
