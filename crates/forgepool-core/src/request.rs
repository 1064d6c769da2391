use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use forgepool_types::{RequestId, RuntimeError};
use tokio::sync::{oneshot, watch};

use crate::access::BackendAccess;
use crate::session::SessionClaimHandle;

/// A predicate a caller supplies to narrow which backends are eligible
/// (spec §3 "Request", `filter`). The core treats it as opaque: it only ever
/// calls it with a candidate's backend type id.
pub type BackendFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Outcome delivered on a request's completion signal.
#[derive(Debug)]
pub enum RequestOutcome {
    Granted(BackendAccess),
    Failed(RuntimeError),
    Cancelled,
}

/// Per-request object tracked by the scheduler (spec §3 "Request").
///
/// Created at intake, inserted into the scheduler's open set, and removed
/// once `result`/`failure` is set or cancellation fires — mirroring the
/// teacher's `TaskRecord`/`ResultStorage::create_task` lifecycle
/// (`runtime/storage.rs`), but keyed to backend acquisition rather than a
/// multi-stage pipeline.
pub struct Request {
    pub id: RequestId,
    pub desired_model: Option<String>,
    pub filter: Option<BackendFilter>,
    pub session: Option<SessionClaimHandle>,
    pub notify_will_load: Option<Arc<dyn Fn() + Send + Sync>>,
    pub start_time_millis: i64,

    /// Model name this request is currently counted against in the pressure
    /// map, if any; cleared when the request is satisfied or dropped.
    pressure_ref: std::sync::Mutex<Option<String>>,

    /// One-shot redirect budget consumed by a `PleaseRedirect` (Design
    /// Notes, "Per-request redirect budget"). `true` until consumed.
    can_redirect: AtomicBool,

    /// Cancellation token linked to both the caller's cancellation and the
    /// registry's global shutdown token (spec §5 "Cancellation"); the intake
    /// layer is responsible for merging those two sources before handing the
    /// resulting receiver to [`Request::new`].
    cancel_rx: watch::Receiver<bool>,

    outcome_tx: std::sync::Mutex<Option<oneshot::Sender<RequestOutcome>>>,
}

impl Request {
    pub fn new(
        id: RequestId,
        desired_model: Option<String>,
        filter: Option<BackendFilter>,
        session: Option<SessionClaimHandle>,
        notify_will_load: Option<Arc<dyn Fn() + Send + Sync>>,
        start_time_millis: i64,
        cancel_rx: watch::Receiver<bool>,
    ) -> (Self, oneshot::Receiver<RequestOutcome>) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let request = Self {
            id,
            desired_model,
            filter,
            session,
            notify_will_load,
            start_time_millis,
            pressure_ref: std::sync::Mutex::new(None),
            can_redirect: AtomicBool::new(true),
            cancel_rx,
            outcome_tx: std::sync::Mutex::new(Some(outcome_tx)),
        };
        (request, outcome_rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn matches(&self, backend_type_id: &str) -> bool {
        match &self.filter {
            Some(f) => f(backend_type_id),
            None => true,
        }
    }

    /// Consume the redirect budget; returns `true` if this is the first and
    /// only time it has been consumed.
    pub fn consume_redirect(&self) -> bool {
        self.can_redirect.swap(false, Ordering::SeqCst)
    }

    /// Requeue this same request after a driver-issued `PleaseRedirect`
    /// (spec §7: "the scheduler treats this as a recoverable miss and
    /// re-queues once"). Consumes the one-shot redirect budget and, if it
    /// hadn't already been spent, resets the outcome channel so the request
    /// can be granted a second time. Returns `None` once the budget is
    /// already spent, in which case the caller must treat the redirect as a
    /// normal failure rather than retrying.
    pub fn requeue_for_redirect(&self) -> Option<oneshot::Receiver<RequestOutcome>> {
        if !self.consume_redirect() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *self.outcome_tx.lock().unwrap() = Some(tx);
        Some(rx)
    }

    pub fn pressure_ref(&self) -> Option<String> {
        self.pressure_ref.lock().unwrap().clone()
    }

    pub fn set_pressure_ref(&self, model: Option<String>) {
        *self.pressure_ref.lock().unwrap() = model;
    }

    /// Deliver a terminal outcome. A no-op if already delivered (a request
    /// may be cancelled and satisfied in the same tick race; first writer
    /// wins, matching the scheduler's single-coordinator discipline).
    pub fn complete(&self, outcome: RequestOutcome) {
        if let Some(tx) = self.outcome_tx.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
    }

}
