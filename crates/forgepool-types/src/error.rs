use thiserror::Error;

use crate::ids::{BackendId, RequestId};

/// Errors produced by the backend lifecycle & dispatch core (spec §7).
///
/// Mirrors the teacher's `runtime::types::RuntimeError` shape: one flat enum
/// with `#[error(...)]` messages, rather than nested per-component error
/// types, since every variant here is something the [`crate` consumer
/// eventually needs to render to a user or an admin.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// No backend of any kind is enabled/running/loading/waiting — distinct
    /// from [`RuntimeError::NoMatchingBackend`] per spec §7.
    #[error("no backends available")]
    NoBackendsAvailable,

    /// At least one backend exists, but none satisfy the request's filter.
    #[error("no backend matches the requested filter")]
    NoMatchingBackend,

    /// Every eligible loader backend has already failed to load this model
    /// (spec §4.4.1 step 3, §7).
    #[error("all backends failed to load model {model}")]
    AllBackendsFailedModel { model: String },

    /// A `getNextBackend` call exceeded its deadline (spec §4.7, §5).
    #[error("timed out waiting for a backend (model {model:?}, {backends_holding} backend(s) currently hold it)")]
    Timeout {
        model: Option<String>,
        backends_holding: usize,
    },

    /// Registry-wide stagnation fail-all (spec §4.4 step 3, Design Notes).
    #[error("request {request_id} failed: no request completed for longer than the stagnation deadline")]
    Stagnation { request_id: RequestId },

    /// Configuration was rejected by the driver at init time; terminal, not
    /// retried (spec §7 "Configuration refusal").
    #[error("backend {backend_id} configuration refused: {message}")]
    ConfigRefused { backend_id: BackendId, message: String },

    /// Transient init failure exhausted its retry budget; backend is now
    /// ERRORED (spec §4.3 step 5, §7).
    #[error("backend {backend_id} failed to initialize after {attempts} attempts: {message}")]
    InitExhausted {
        backend_id: BackendId,
        attempts: u32,
        message: String,
    },

    /// The driver's `generateLive` raised an error that was not a
    /// `PleaseRedirect` (or a second redirect was attempted).
    #[error("generation failed on backend {backend_id}: {message}")]
    GenerationFailed { backend_id: BackendId, message: String },

    /// Referenced a backend id that the registry doesn't know about.
    #[error("backend not found: {0}")]
    BackendNotFound(BackendId),

    /// Referenced a request id no longer tracked (already completed/cancelled).
    #[error("request not found: {0}")]
    RequestNotFound(RequestId),

    /// The registry is mid-shutdown and refuses new admission (spec §4.7).
    #[error("registry is shutting down")]
    ShuttingDown,

    /// Persisted registry file existed but failed to parse; registry starts
    /// empty and the file is left untouched on disk (spec §6).
    #[error("failed to parse registry file {path}: {message}")]
    RegistryFileCorrupt { path: String, message: String },

    /// I/O failure writing the persisted registry file under the save lock.
    #[error("failed to persist registry file {path}: {message}")]
    RegistryFileWrite { path: String, message: String },

    /// An API was called before the core finished standing up (e.g. an
    /// admin route hit before `Core::spawn` ran).
    #[error("core not initialized")]
    NotInitialized,
}
