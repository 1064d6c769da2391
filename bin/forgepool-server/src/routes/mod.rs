//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - CORS
//! - Health / heartbeat route
//! - `/v1` generation and session-status routes
//! - `/admin` backend-management routes (bearer-token protected when
//!   `FORGEPOOL_ADMIN_TOKEN` is set)

mod admin;
mod generate;
mod health;
mod session;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    let v1 = Router::new().merge(generate::router()).merge(session::router());

    Router::new()
        .merge(health::router())
        .nest("/v1", v1)
        .nest("/admin", admin::router())
        .layer(cors)
        .with_state(state)
}
