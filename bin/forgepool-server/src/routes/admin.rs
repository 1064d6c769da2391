//! Backend-management routes, nested under `/admin` and protected by
//! [`crate::middleware::check_admin_auth`] when `FORGEPOOL_ADMIN_TOKEN` is set.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::middleware;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use forgepool_types::BackendId;
use tracing::info;

use crate::error::ServerError;
use crate::middleware::check_admin_auth;
use crate::schemas::{AddBackendRequest, BackendSummary, EditBackendRequest};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/backends", get(list_backends).post(add_backend))
        .route("/backends/{id}", put(edit_backend).delete(delete_backend))
        .route("/backends/reload", post(reload_all))
        .layer(middleware::from_fn(check_admin_auth))
}

async fn summarize(record: &Arc<forgepool_core::BackendRecord>) -> BackendSummary {
    BackendSummary {
        id: record.id.0,
        type_id: record.back_type.id.clone(),
        title: record.title().await,
        enabled: record.enabled().await,
        status: format!("{:?}", record.status().await),
        current_model_name: record.current_model_name().await,
        usages: record.usages(),
        max_usages: record.max_usages(),
        reserved: record.reserved(),
        mod_count: record.mod_count(),
    }
}

/// `GET /admin/backends` (spec §4.2 `registry.all()`).
pub async fn list_backends(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<BackendSummary>> {
    let mut out = Vec::new();
    for record in state.registry.all() {
        out.push(summarize(&record).await);
    }
    Json(out)
}

/// `POST /admin/backends` (spec §4.2 `add`/`addNonreal`).
pub async fn add_backend(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddBackendRequest>,
) -> Result<Json<BackendSummary>, ServerError> {
    let record = if req.nonreal {
        state
            .registry
            .add_nonreal(&req.type_id, req.title, req.settings)
            .await?
    } else {
        state
            .registry
            .add(&req.type_id, req.title, req.settings, req.enabled)
            .await?
    };
    info!(backend_id = %record.id, "backend added");
    Ok(Json(summarize(&record).await))
}

/// `PUT /admin/backends/{id}` (spec §4.2 `editById`).
pub async fn edit_backend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<EditBackendRequest>,
) -> Result<Json<BackendSummary>, ServerError> {
    let record = state
        .registry
        .edit_by_id(BackendId(id), req.settings, req.title)
        .await?;
    info!(backend_id = %record.id, "backend edited");
    Ok(Json(summarize(&record).await))
}

/// `DELETE /admin/backends/{id}` (spec §4.2 `deleteById`).
pub async fn delete_backend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let deleted = state.registry.delete_by_id(BackendId(id)).await?;
    if !deleted {
        return Err(ServerError::NotFound(format!("backend {id}")));
    }
    info!(backend_id = id, "backend deleted");
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// `POST /admin/backends/reload` (spec §4.2 `reloadAll`).
pub async fn reload_all(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.registry.reload_all().await;
    info!("all backends reloaded");
    Json(serde_json::json!({ "reloaded": true }))
}
