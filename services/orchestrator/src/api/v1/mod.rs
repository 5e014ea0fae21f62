//! API v1 routes.

mod nodes;
mod sessions;
mod users;

use axum::Router;

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/nodes", nodes::routes())
        .nest("/sessions", sessions::routes())
        .nest("/users", users::routes())
}

/// Parse a prefixed id from a path segment.
fn parse_id<T: std::str::FromStr>(raw: &str, kind: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid_{kind}_id"), format!("Invalid {kind} ID format")))
}
