//! Session inspection endpoint

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use clipq_common::Session;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// GET /sessions/:session_id
///
/// Current snapshot: cursor, buffered sequence numbers, status, failure
/// reason and claim expiry.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    state
        .store
        .get(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {}", session_id)))
}

pub fn session_routes() -> Router<AppState> {
    Router::new().route("/sessions/:session_id", get(get_session))
}
