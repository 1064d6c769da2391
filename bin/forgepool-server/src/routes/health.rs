//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Returns `{"status": "ok", "version": "...", "backends": N}` with HTTP 200.
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "backends": state.registry.all().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgepool_core::{Core, RegistryConfig};

    #[tokio::test]
    async fn health_response_has_ok_status() {
        let (core, _listener) = Core::new(RegistryConfig::default());
        let state = Arc::new(AppState {
            config: Arc::new(crate::config::Config::from_env()),
            registry: core.registry,
            scheduler: core.scheduler,
            sessions: core.sessions,
        });
        let Json(body) = get_health(State(state)).await;
        assert_eq!(body["status"], "ok");
    }
}
