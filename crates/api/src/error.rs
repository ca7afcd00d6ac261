//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use makerbox_reconcile::ReconcileError;

/// API-facing error: carries the taxonomy kind for clients and maps each
/// class to a status code. The webhook endpoint does NOT use this mapping;
/// its 200/503 contract is handled in the route itself.
#[derive(Debug)]
pub struct ApiError(pub ReconcileError);

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ReconcileError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            ReconcileError::ObjectNotFound(_) | ReconcileError::ItemNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ReconcileError::UserNotResolved(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconcileError::TransientStore(_) | ReconcileError::ProviderApi(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ReconcileError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::warn!(error = %self.0, "request rejected");
        }

        let body = Json(json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        let cases = [
            (ReconcileError::InvalidEvent("x".into()), 400),
            (ReconcileError::ObjectNotFound("x".into()), 404),
            (ReconcileError::ItemNotFound("x".into()), 404),
            (ReconcileError::UserNotResolved("x".into()), 422),
            (ReconcileError::TransientStore("x".into()), 503),
            (ReconcileError::ProviderApi("x".into()), 503),
            (ReconcileError::Config("x".into()), 500),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status().as_u16(), expected);
        }
    }
}
