use axum::{Json, Router, body::Bytes, extract::Extension, http::StatusCode, routing::post};
use std::sync::Arc;

use super::protocol::{ControlRequest, ControlResponse, ENDPOINT_CONTROL};
use super::service::Coordinator;
use crate::error::ErrorKind;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route(ENDPOINT_CONTROL, post(handle_control))
        .layer(Extension(coordinator))
}

/// The body is parsed by hand so malformed input still gets a typed
/// `ControlResponse::Error` back.
pub async fn handle_control(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    body: Bytes,
) -> (StatusCode, Json<ControlResponse>) {
    let request: ControlRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Malformed control request: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(ControlResponse::Error {
                    kind: ErrorKind::Protocol,
                    message: format!("malformed control request: {}", e),
                }),
            );
        }
    };

    tracing::debug!("Control request {}", request.name());
    let response = coordinator.dispatch(request);
    let status = match &response {
        ControlResponse::Error { kind, .. } => status_for(*kind),
        _ => StatusCode::OK,
    };
    (status, Json(response))
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Connection => StatusCode::BAD_GATEWAY,
        ErrorKind::Protocol => StatusCode::BAD_REQUEST,
        ErrorKind::Resource => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
    }
}
