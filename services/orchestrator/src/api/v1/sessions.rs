//! Session endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sparkling_id::{SessionId, UserId};

use super::parse_id;
use crate::api::error::ApiError;
use crate::model::Session;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sessions).post(request_session))
        .route("/{session_id}", get(get_session).delete(stop_session))
}

#[derive(Debug, Deserialize)]
pub struct RequestSessionRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct SessionResponse {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Notebook credentials, present once the session has run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_port: Option<u16>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id.to_string(),
            user_id: session.user_id.to_string(),
            status: session.status.to_string(),
            start_time: session.start_time,
            end_time: session.end_time,
            container_id: session.container_id.map(|id| id.to_string()),
            access_token: session.access_token,
            access_port: session.access_port,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub items: Vec<SessionResponse>,
}

/// GET /v1/sessions[?user_id=]
async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = query
        .user_id
        .as_deref()
        .map(|raw| parse_id::<UserId>(raw, "user"))
        .transpose()?;
    let items = state
        .sessions()
        .list(user_id)
        .await?
        .into_iter()
        .map(SessionResponse::from)
        .collect();
    Ok(Json(ListSessionsResponse { items }))
}

/// POST /v1/sessions
///
/// Records the session and provisions it in the background.
async fn request_session(
    State(state): State<AppState>,
    Json(req): Json<RequestSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: UserId = parse_id(&req.user_id, "user")?;
    let session = state.sessions().request(user_id).await?;
    Ok((StatusCode::ACCEPTED, Json(SessionResponse::from(session))))
}

/// GET /v1/sessions/{session_id}
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id: SessionId = parse_id(&session_id, "session")?;
    let session = state.sessions().get(session_id).await?;
    Ok(Json(SessionResponse::from(session)))
}

/// DELETE /v1/sessions/{session_id}
async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id: SessionId = parse_id(&session_id, "session")?;
    let session = state.sessions().stop(session_id).await?;
    Ok(Json(SessionResponse::from(session)))
}
