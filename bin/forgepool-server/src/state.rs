//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use forgepool_core::{BackendRegistry, SchedulerLoop, SessionDirectory};

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<BackendRegistry>,
    pub scheduler: Arc<SchedulerLoop>,
    pub sessions: SessionDirectory,
}
