//! Operational endpoints for failed-event inspection and replay.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use makerbox_reconcile::ReconcileError;

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

pub async fn list_failed_events(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 500);
    let events = state.reconcile.events().list_failed(limit).await?;

    let events: Vec<serde_json::Value> = events
        .into_iter()
        .map(|e| {
            json!({
                "event_id": e.stripe_event_id,
                "event_type": e.event_type,
                "received_at": e.received_at.unix_timestamp(),
                "result": e.processing_result,
                "error": e.error_message,
            })
        })
        .collect();

    Ok(Json(json!({ "count": events.len(), "events": events })))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let event = state
        .reconcile
        .events()
        .get(&event_id)
        .await?
        .ok_or_else(|| ReconcileError::ObjectNotFound(format!("event {event_id}")))?;

    Ok(Json(json!({
        "event_id": event.stripe_event_id,
        "event_type": event.event_type,
        "received_at": event.received_at.unix_timestamp(),
        "result": event.processing_result,
        "error": event.error_message,
        "payload": event.raw_payload,
    })))
}

pub async fn replay_failed_events(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 500);
    let summary = state.reconcile.replay_failed(limit).await?;

    Ok(Json(json!({
        "replayed": summary.replayed,
        "succeeded": summary.succeeded,
        "failed": summary.failed,
    })))
}

pub async fn maintenance_sweep(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.reconcile.maintenance_sweep().await?;
    Ok(Json(json!({ "status": "ok" })))
}
