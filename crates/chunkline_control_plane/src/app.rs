use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use chunkline_contract::{CleanupResponse, HandshakeRequest, SessionStatus};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

use crate::coordinator::{CoordinatorError, UploadCoordinator};

const BODY_LIMIT_SLACK: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseUpdate {
    pub event_type: String,
    pub data: Value,
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<UploadCoordinator>,
    pub orphan_max_age: Duration,
    pub sse_bus: broadcast::Sender<SseUpdate>,
}

impl AppState {
    pub fn new(coordinator: Arc<UploadCoordinator>, orphan_max_age: Duration) -> Self {
        let (sse_bus, _) = broadcast::channel(256);
        Self {
            coordinator,
            orphan_max_age,
            sse_bus,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.coordinator.chunk_size())
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .route("/health/live", get(health_live))
        .route("/v1/uploads/handshake", post(handshake))
        .route("/v1/uploads/cleanup", post(cleanup))
        .route("/v1/uploads/{session_id}", get(session_status))
        .route(
            "/v1/uploads/{session_id}/chunks/{chunk_index}",
            put(accept_chunk),
        )
        .route("/v1/uploads/{session_id}/finalize", post(finalize))
        .route("/v1/events/stream", get(stream_events))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn handshake(
    State(state): State<AppState>,
    Json(payload): Json<HandshakeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let response = state
        .coordinator
        .handshake(&payload)
        .await
        .map_err(error_response)?;

    emit(
        &state,
        "upload.session.opened",
        json!({
            "session_id": response.session_id.clone(),
            "filename": payload.filename,
            "existing_chunks": response.existing_chunks.len()
        }),
    );

    Ok((StatusCode::OK, Json(response)))
}

async fn accept_chunk(
    State(state): State<AppState>,
    Path((session_id, chunk_index)): Path<(String, u64)>,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let ack = state
        .coordinator
        .accept_chunk(&session_id, chunk_index, &body)
        .await
        .map_err(error_response)?;

    emit(
        &state,
        "upload.chunk.completed",
        json!({ "session_id": session_id, "chunk_index": chunk_index }),
    );

    Ok((StatusCode::OK, Json(ack)))
}

async fn finalize(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state.coordinator.finalize(&session_id).await {
        Ok(response) => {
            if response.hash.is_some() {
                emit(
                    &state,
                    "upload.session.completed",
                    json!({ "session_id": session_id, "hash": response.hash.clone() }),
                );
            }
            Ok((StatusCode::OK, Json(response)))
        }
        Err(err) => {
            if let CoordinatorError::Integrity { reason, .. } = &err {
                emit(
                    &state,
                    "upload.session.failed",
                    json!({
                        "session_id": session_id,
                        "status": SessionStatus::Failed,
                        "reason": reason
                    }),
                );
            }
            Err(error_response(err))
        }
    }
}

async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let status = state
        .coordinator
        .status(&session_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::OK, Json(status)))
}

async fn cleanup(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let reclaimed = state
        .coordinator
        .cleanup_orphans(state.orphan_max_age)
        .await
        .map_err(error_response)?;

    info!(reclaimed, "cleanup requested over http");
    emit(
        &state,
        "upload.cleanup.completed",
        json!({ "reclaimed": reclaimed }),
    );
    Ok((StatusCode::OK, Json(CleanupResponse { reclaimed })))
}

async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.sse_bus.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(update) => {
                let data = serde_json::to_string(&update.data).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(update.event_type).data(data)))
            }
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn error_response(err: CoordinatorError) -> (StatusCode, Json<Value>) {
    let (status, code) = match &err {
        CoordinatorError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        CoordinatorError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
        CoordinatorError::NotUploading { .. } => (StatusCode::CONFLICT, "session_not_uploading"),
        CoordinatorError::Integrity { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "integrity_failure")
        }
        CoordinatorError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        warn!(error = %err, "request rejected");
    }
    (
        status,
        Json(json!({ "error": code, "detail": err.to_string() })),
    )
}

fn emit(state: &AppState, event_type: &str, data: Value) {
    let _ = state.sse_bus.send(SseUpdate {
        event_type: event_type.to_string(),
        data,
    });
}
