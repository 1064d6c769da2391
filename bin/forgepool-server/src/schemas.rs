//! Request/response DTOs for the HTTP surface.

use serde::{Deserialize, Serialize};

/// `POST /admin/backends` body.
#[derive(Debug, Deserialize)]
pub struct AddBackendRequest {
    /// Registered backend type, e.g. `"local-process"`.
    pub type_id: String,
    pub title: String,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When true, the backend is never persisted and gets a negative id
    /// (spec §4.2 `addNonreal`).
    #[serde(default)]
    pub nonreal: bool,
}

fn default_true() -> bool {
    true
}

/// `PUT /admin/backends/{id}` body.
#[derive(Debug, Deserialize)]
pub struct EditBackendRequest {
    pub title: Option<String>,
    pub settings: serde_json::Value,
}

/// One entry in the `GET /admin/backends` response.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSummary {
    pub id: i64,
    pub type_id: String,
    pub title: String,
    pub enabled: bool,
    pub status: String,
    pub current_model_name: Option<String>,
    pub usages: u32,
    pub max_usages: u32,
    pub reserved: bool,
    pub mod_count: u64,
}

/// `POST /v1/generate` body.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    /// Model name to request; `None` means "any model this filter admits".
    pub model: Option<String>,
    /// Session id to attribute usage counters and cancellation to.
    pub session_id: String,
    /// Maximum time to wait for a backend before giving up, in milliseconds.
    #[serde(default = "default_max_wait_millis")]
    pub max_wait_millis: u64,
    /// Opaque payload handed verbatim to the backend driver.
    pub input: serde_json::Value,
}

fn default_max_wait_millis() -> u64 {
    60_000
}

/// One accumulated event from a generation, returned as a flat list rather
/// than a stream since this demonstration endpoint is not chunked (spec §1
/// "Non-goals" excludes wire-level streaming framing).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEventDto {
    Progress { step: u32, total: u32 },
    Image { bytes_base64: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateResponse {
    pub backend_id: i64,
    pub events: Vec<GenerationEventDto>,
}

/// `GET /v1/sessions/{id}` response.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub waiting: i64,
    pub loading_models: i64,
    pub waiting_backends: i64,
    pub live: i64,
}
