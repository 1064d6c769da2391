use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Why a driver's `init()` failed (spec §4.1).
#[derive(Debug, Clone, Error)]
pub enum InitError {
    /// Configuration is invalid; retrying will not help.
    #[error("refused: {0}")]
    Refused(String),
    /// Likely transient (network hiccup, process not ready yet); worth retrying.
    #[error("transient: {0}")]
    Transient(String),
}

/// Supported-feature set and model catalog a driver reports after a
/// successful `init()` (spec §4.1).
#[derive(Debug, Clone, Default)]
pub struct DriverCapabilities {
    /// Model names the driver currently reports as loaded, keyed by category
    /// (e.g. `"main"`, `"vae"`, `"lora"`, `"controlnet"`, `"embedding"`).
    pub models_by_category: HashMap<String, Vec<String>>,
    /// `true` if this driver instance can swap its resident model at all.
    pub can_load_models: bool,
    /// Upper bound on concurrent generations this driver will accept.
    pub max_usages: u32,
}

/// Raised by [`BackendDriver::generate_live`] to ask the scheduler to retry
/// the request against a different backend (spec §4.1, §7). The scheduler
/// honors this at most once per request (Design Notes, "redirect budget").
#[derive(Debug, Clone, Error)]
#[error("please redirect: {0}")]
pub struct PleaseRedirect(pub String);

/// A single event emitted during a streaming generation: either a progress
/// update or a completed image. Opaque payloads, since encoding/metadata
/// embedding is out of scope (spec §1).
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Progress { step: u32, total: u32 },
    Image { bytes: std::sync::Arc<[u8]> },
}

/// Error surfaced from a generation that was not a [`PleaseRedirect`]
/// (spec §7, "Generation failure").
#[derive(Debug, Clone, Error)]
#[error("generation failed: {0}")]
pub struct GenerationError(pub String);

/// Outcome of a `generateLive` call, distinguishing a hard failure from a
/// redirect request so callers don't have to downcast.
#[derive(Debug, Clone, Error)]
pub enum GenerateOutcome {
    #[error(transparent)]
    Failed(#[from] GenerationError),
    #[error(transparent)]
    Redirect(#[from] PleaseRedirect),
}

/// One per backend type; wraps spawn/init/health/shutdown/generate/load-model
/// of a single worker process or remote endpoint (spec §4.1).
///
/// The core treats every driver as opaque: it dispatches through this trait
/// and otherwise never inspects how a driver talks to its worker. Mirrors the
/// teacher's `engine::ggml::*::backend` per-engine dispatch surface, but named
/// for the operations spec.md names rather than a specific inference stack.
#[async_trait]
pub trait BackendDriver: Send + Sync + 'static {
    /// Blocking bring-up. On success the driver is ready to serve.
    async fn init(&self) -> Result<DriverCapabilities, InitError>;

    /// Cooperative teardown; callable at any status, must be idempotent.
    async fn shutdown_now(&self);

    /// Swap the resident model. Must not be called while any usage slot is
    /// held; the registry enforces this by only invoking it under
    /// `reserveModelLoad = true, usages = 0` (spec §4.4.1 step 4).
    async fn load_model(&self, model: &str) -> bool;

    /// Streaming generation. `on_event` is called once per event, in the
    /// order the worker produced them, and returns when every output has
    /// been delivered or an error has been raised.
    async fn generate_live(
        &self,
        input: serde_json::Value,
        batch_id: u64,
        on_event: &mut (dyn FnMut(GenerationEvent) + Send),
    ) -> Result<(), GenerateOutcome>;

    /// `true` if this driver instance is capable of swapping models at all.
    fn can_load_models(&self) -> bool;
}
