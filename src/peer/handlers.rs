use axum::{
    Json, Router,
    extract::Extension,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use std::sync::Arc;

use super::agent::{CreateOutcome, PeerAgent};
use crate::config::DEFAULT_REPLICATION_FACTOR;
use crate::coordinator::handlers::status_for;
use crate::coordinator::protocol::{
    CONTENT_TYPE_FRAME, ControlResponse, CreateFileRequest, CreateFileResponse, DownloadRequest,
    ENDPOINT_CHUNK, ENDPOINT_CREATE, ENDPOINT_DOWNLOAD, ENDPOINT_REPLICATE, FetchChunkRequest,
    ReplicateOrder, ReplicateResponse,
};
use crate::error::ClusterError;

pub fn router(agent: Arc<PeerAgent>) -> Router {
    Router::new()
        .route(ENDPOINT_CHUNK, post(handle_fetch_chunk))
        .route(ENDPOINT_REPLICATE, post(handle_replicate))
        .route(ENDPOINT_CREATE, post(handle_create))
        .route(ENDPOINT_DOWNLOAD, post(handle_download))
        .layer(Extension(agent))
}

pub async fn handle_fetch_chunk(
    Extension(agent): Extension<Arc<PeerAgent>>,
    Json(req): Json<FetchChunkRequest>,
) -> Response {
    match agent.serve_chunk(&req.file_id, req.sequence_index) {
        Ok(frame) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE_FRAME)],
            frame,
        )
            .into_response(),
        Err(e) => {
            tracing::debug!("Cannot serve chunk {} of {}: {}", req.sequence_index, req.file_id, e);
            (status_for(e.kind()), Json(ControlResponse::from(e))).into_response()
        }
    }
}

pub async fn handle_replicate(
    Extension(agent): Extension<Arc<PeerAgent>>,
    Json(order): Json<ReplicateOrder>,
) -> (StatusCode, Json<ReplicateResponse>) {
    tracing::info!(
        "Replica order for {} from {}",
        order.file_id,
        order.source_peer_id
    );
    let result = agent.replicate(order).await;
    (StatusCode::OK, Json(ReplicateResponse::from_result(result)))
}

pub async fn handle_create(
    Extension(agent): Extension<Arc<PeerAgent>>,
    Json(req): Json<CreateFileRequest>,
) -> (StatusCode, Json<CreateFileResponse>) {
    let replication_factor = req.replication_factor.unwrap_or(DEFAULT_REPLICATION_FACTOR);
    let outcome = match agent.create_file(req.name, req.size_bytes, replication_factor) {
        Ok(ticket) => ticket.wait().await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(CreateOutcome::Registered { file_id }) => (
            StatusCode::OK,
            Json(CreateFileResponse {
                file_id: Some(file_id),
                registered: true,
                error: None,
            }),
        ),
        Ok(CreateOutcome::LocalOnly { file_id, reason }) => (
            StatusCode::OK,
            Json(CreateFileResponse {
                file_id: Some(file_id),
                registered: false,
                error: Some(ClusterError::Connection(reason).into()),
            }),
        ),
        Err(e) => (
            status_for(e.kind()),
            Json(CreateFileResponse {
                file_id: None,
                registered: false,
                error: Some(e.into()),
            }),
        ),
    }
}

pub async fn handle_download(
    Extension(agent): Extension<Arc<PeerAgent>>,
    Json(req): Json<DownloadRequest>,
) -> (StatusCode, Json<ReplicateResponse>) {
    let result = agent.download(&req.file_id).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => status_for(e.kind()),
    };
    (status, Json(ReplicateResponse::from_result(result)))
}
