//! Payment-provider webhook endpoint.
//!
//! Response contract: 2xx acknowledges a terminal outcome (processed,
//! duplicate, ignored, or terminally rejected) so the provider stops
//! redelivering; 503 signals a transient failure so the provider
//! redelivers. A forged or malformed delivery is therefore answered 200,
//! after its audit row is written.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;

use makerbox_reconcile::WebhookOutcome;

use crate::state::AppState;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<serde_json::Value>) {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match state.reconcile.process_webhook(&body, signature).await {
        Ok(WebhookOutcome::Processed { event_id }) => (
            StatusCode::OK,
            Json(json!({ "received": true, "status": "processed", "event_id": event_id })),
        ),
        Ok(WebhookOutcome::Duplicate {
            event_id,
            prior_result,
        }) => (
            StatusCode::OK,
            Json(json!({
                "received": true,
                "status": "duplicate",
                "event_id": event_id,
                "prior_result": prior_result,
            })),
        ),
        Ok(WebhookOutcome::Ignored {
            event_id,
            event_type,
        }) => (
            StatusCode::OK,
            Json(json!({
                "received": true,
                "status": "ignored",
                "event_id": event_id,
                "event_type": event_type,
            })),
        ),
        Ok(WebhookOutcome::Rejected {
            event_id, kind, ..
        }) => (
            // Terminal rejection: acknowledged so the provider stops.
            StatusCode::OK,
            Json(json!({
                "received": true,
                "status": "rejected",
                "event_id": event_id,
                "kind": kind,
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "webhook processing failed transiently");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "received": false, "kind": e.kind() })),
            )
        }
    }
}
