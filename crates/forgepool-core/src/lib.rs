//! Backend lifecycle and dispatch core for a pool of out-of-process,
//! single-model-resident inference workers.
//!
//! This crate is the orchestrator described by the system overview: it owns
//! backend processes, their health and load state, and the scheduler that
//! matches pending requests to eligible backends, decides when a backend
//! should evict its model to serve a queued request, serializes model loads
//! against in-flight uses, and propagates per-session usage counters.
//! Request intake, workflow construction, and settings persistence are
//! deliberately not part of this crate; see `forgepool-server` for a
//! demonstration intake layer built on top of it.

pub mod access;
pub mod clock;
pub mod driver;
pub mod intake;
pub mod pressure;
pub mod record;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod wake;

pub use access::BackendAccess;
pub use driver::{
    BackendDriver, DriverCapabilities, GenerateOutcome, GenerationError, GenerationEvent,
    InitError, PleaseRedirect,
};
pub use intake::{get_next_backend, get_next_backend_and_generate, GetNextBackendParams};
pub use pressure::{PressureEntry, PressureMap};
pub use record::BackendRecord;
pub use registry::{BackendFactory, BackendRegistry, PersistedBackend, RegistryConfig};
pub use request::{BackendFilter, Request, RequestOutcome};
pub use scheduler::SchedulerLoop;
pub use session::{Session, SessionClaimHandle, SessionCounters, SessionDirectory};
pub use wake::{Waker, WakeListener};

/// Bundles the pieces an embedding binary needs to stand up the core:
/// register types, call [`BackendRegistry::load`], then
/// [`BackendRegistry::spawn_init_worker`] and [`SchedulerLoop::spawn`].
pub struct Core {
    pub registry: std::sync::Arc<BackendRegistry>,
    pub scheduler: std::sync::Arc<SchedulerLoop>,
    pub sessions: SessionDirectory,
}

impl Core {
    pub fn new(config: RegistryConfig) -> (Self, WakeListener) {
        let (waker, listener) = Waker::new();
        let registry = BackendRegistry::new(config, waker);
        let sessions = SessionDirectory::new();
        let scheduler = SchedulerLoop::new(registry.clone(), sessions.clone());
        (
            Self {
                registry,
                scheduler,
                sessions,
            },
            listener,
        )
    }

    /// Start the background init worker and scheduler tick loop.
    pub fn spawn(&self, listener: WakeListener, shutdown: tokio::sync::watch::Receiver<bool>) {
        self.registry.spawn_init_worker();
        self.scheduler.spawn(listener, shutdown);
    }
}
