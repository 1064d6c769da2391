//! Per-session status surface (spec §4.6 "Status surface").

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};

use crate::error::ServerError;
use crate::schemas::SessionStatusResponse;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/{id}", get(get_session_status).delete(forget_session))
}

/// `GET /v1/sessions/{id}`.
pub async fn get_session_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatusResponse>, ServerError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| ServerError::NotFound(format!("session {id}")))?;
    let counters = session.counters();
    Ok(Json(SessionStatusResponse {
        session_id: id,
        waiting: counters.waiting,
        loading_models: counters.loading_models,
        waiting_backends: counters.waiting_backends,
        live: counters.live,
    }))
}

/// `DELETE /v1/sessions/{id}`: drop the session's tracking entry. Any claims
/// still held by in-flight requests keep completing normally; this only
/// forgets the directory entry so a fresh session is created on next use.
pub async fn forget_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    state.sessions.forget(&id);
    Json(serde_json::json!({ "forgotten": true }))
}
