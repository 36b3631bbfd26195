//! HTTP surface over the coordinator.
//!
//! Thin handlers: identity comes from the `x-user-id` header, every
//! lifecycle decision lives in the coordinator, and errors map onto
//! status codes here and nowhere else.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use driftcast_core::StreamSession;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::coordinator::StreamCoordinator;
use crate::error::StreamError;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: StreamCoordinator,
}

pub fn router(coordinator: StreamCoordinator) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/streams", post(create_stream).get(list_streams))
        .route("/streams/:id/join", post(join_stream))
        .route("/streams/:id/leave", post(leave_stream))
        .route("/streams/:id/end", post(end_stream))
        .route("/streams/:id/kick", post(kick_participant))
        .route("/streams/:id/ban", post(ban_participant))
        .route("/streams/:id/mute", post(set_muted))
        .with_state(AppState { coordinator })
}

#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    #[serde(default)]
    pub title: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateStreamResponse {
    pub stream_id: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinStreamRequest {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModerationRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    pub user_id: String,
    pub muted: bool,
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn create_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateStreamRequest>,
) -> Result<Json<CreateStreamResponse>, Response> {
    let user_id = caller_id(&headers)?;
    let stream_id = state
        .coordinator
        .create(
            &request.title,
            &user_id,
            &request.display_name,
            request.avatar_url,
        )
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(CreateStreamResponse { stream_id }))
}

async fn list_streams(
    State(state): State<AppState>,
) -> Result<Json<Vec<StreamSession>>, Response> {
    let streams = state
        .coordinator
        .active_streams()
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(streams))
}

async fn join_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<JoinStreamRequest>,
) -> Result<StatusCode, Response> {
    let user_id = caller_id(&headers)?;
    state
        .coordinator
        .join(
            &stream_id,
            &user_id,
            &request.display_name,
            request.avatar_url,
        )
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leave_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, Response> {
    let user_id = caller_id(&headers)?;
    state
        .coordinator
        .leave(&stream_id, &user_id)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn end_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, Response> {
    let user_id = caller_id(&headers)?;
    state
        .coordinator
        .end(
            &stream_id,
            driftcast_core::EndReason::HostEnded,
            Some(&user_id),
        )
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn kick_participant(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ModerationRequest>,
) -> Result<StatusCode, Response> {
    let user_id = caller_id(&headers)?;
    state
        .coordinator
        .kick(&stream_id, &user_id, &request.user_id)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ban_participant(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ModerationRequest>,
) -> Result<StatusCode, Response> {
    let user_id = caller_id(&headers)?;
    state
        .coordinator
        .ban(&stream_id, &user_id, &request.user_id)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_muted(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<MuteRequest>,
) -> Result<StatusCode, Response> {
    let user_id = caller_id(&headers)?;
    state
        .coordinator
        .set_muted(&stream_id, &user_id, &request.user_id, request.muted)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(StatusCode::NO_CONTENT)
}

fn caller_id(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "missing x-user-id header" })),
            )
                .into_response()
        })
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = match &self {
            StreamError::AlreadyInStream => StatusCode::CONFLICT,
            StreamError::StreamNotFound => StatusCode::NOT_FOUND,
            StreamError::StreamEnded => StatusCode::GONE,
            StreamError::NotAuthorized => StatusCode::FORBIDDEN,
            StreamError::Store(_) => StatusCode::BAD_GATEWAY,
            StreamError::CoordinatorClosed => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
