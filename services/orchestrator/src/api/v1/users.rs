//! User endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sparkling_id::UserId;

use super::parse_id;
use crate::api::error::ApiError;
use crate::error::OrchestratorError;
use crate::model::User;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_user))
        .route("/{user_id}", get(get_user))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    #[serde(default)]
    pub balance_hours: f64,
    #[serde(default)]
    pub unlimited: bool,
}

/// POST /v1/users
async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_name", "User name is required"));
    }
    if !req.balance_hours.is_finite() || req.balance_hours < 0.0 {
        return Err(ApiError::bad_request(
            "invalid_balance",
            "balance_hours must be a non-negative number",
        ));
    }

    let user = User {
        id: UserId::new(),
        name: req.name.trim().to_string(),
        balance_hours: req.balance_hours,
        unlimited: req.unlimited,
    };
    state
        .store()
        .insert_user(&user)
        .await
        .map_err(OrchestratorError::from)?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /v1/users/{user_id}
async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: UserId = parse_id(&user_id, "user")?;
    let user = state
        .store()
        .get_user(user_id)
        .await
        .map_err(OrchestratorError::from)?
        .ok_or_else(|| ApiError::not_found("user_not_found", format!("User {user_id} not found")))?;
    Ok(Json(user))
}
