use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex};

/// Four integer counters exposed verbatim to the intake layer for status
/// reporting (spec §3 "Session Claim", §6 "Status surface").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionCounters {
    pub waiting: i64,
    pub loading_models: i64,
    pub waiting_backends: i64,
    pub live: i64,
}

struct SessionInner {
    counters: AtomicCounters,
    cancel_tx: Mutex<watch::Sender<bool>>,
}

#[derive(Default)]
struct AtomicCounters {
    waiting: AtomicI64,
    loading_models: AtomicI64,
    waiting_backends: AtomicI64,
    live: AtomicI64,
}

impl AtomicCounters {
    fn snapshot(&self) -> SessionCounters {
        SessionCounters {
            waiting: self.waiting.load(Ordering::SeqCst),
            loading_models: self.loading_models.load(Ordering::SeqCst),
            waiting_backends: self.waiting_backends.load(Ordering::SeqCst),
            live: self.live.load(Ordering::SeqCst),
        }
    }

    fn apply(&self, delta: SessionCounters) {
        if delta.waiting != 0 {
            self.waiting.fetch_add(delta.waiting, Ordering::SeqCst);
        }
        if delta.loading_models != 0 {
            self.loading_models
                .fetch_add(delta.loading_models, Ordering::SeqCst);
        }
        if delta.waiting_backends != 0 {
            self.waiting_backends
                .fetch_add(delta.waiting_backends, Ordering::SeqCst);
        }
        if delta.live != 0 {
            self.live.fetch_add(delta.live, Ordering::SeqCst);
        }
    }
}

/// A session's status-reporting and collective-cancellation identity
/// (spec §4.6). Cheap to clone; all clones share the same counters and
/// cancellation source.
#[derive(Clone)]
pub struct Session {
    id: String,
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            id: id.into(),
            inner: Arc::new(SessionInner {
                counters: AtomicCounters::default(),
                cancel_tx: Mutex::new(cancel_tx),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn counters(&self) -> SessionCounters {
        self.inner.counters.snapshot()
    }

    /// Open a scoped claim against this session's counters (spec §4.6
    /// `session.claim(...)`). Extending/completing it adjusts both the claim
    /// and the session atomically with respect to the counter arithmetic.
    pub fn claim(&self, initial: SessionCounters) -> SessionClaimHandle {
        self.inner.counters.apply(initial);
        SessionClaimHandle {
            session: self.clone(),
            held: Arc::new(std::sync::Mutex::new(initial)),
        }
    }

    /// Subscribe to this session's cancellation token. Every outstanding
    /// claim/request observes cancellation via the receiver it captured at
    /// creation time, so an `interrupt()` that replaces the sender only
    /// affects *new* subscribers — exactly as spec §4.6 describes.
    pub async fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.inner.cancel_tx.lock().await.subscribe()
    }

    /// Replace the cancellation source with a fresh one and fire the old
    /// one, so every claim/request holding the previous receiver observes
    /// cancellation exactly once (spec §4.6 `interrupt()`).
    pub async fn interrupt(&self) {
        let mut guard = self.inner.cancel_tx.lock().await;
        let _ = guard.send(true);
        let (new_tx, _) = watch::channel(false);
        *guard = new_tx;
    }
}

/// A scoped resource representing outstanding counts a session is owed
/// credit for (spec §4.6). Disposing it (via `Drop`) auto-completes
/// whatever counts it still holds, matching the "Session counter
/// conservation" testable property: every `extend` eventually pairs with a
/// `complete`.
pub struct SessionClaimHandle {
    session: Session,
    held: Arc<std::sync::Mutex<SessionCounters>>,
}

impl SessionClaimHandle {
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn extend(&self, delta: SessionCounters) {
        self.session.inner.counters.apply(delta);
        let mut held = self.held.lock().unwrap();
        held.waiting += delta.waiting;
        held.loading_models += delta.loading_models;
        held.waiting_backends += delta.waiting_backends;
        held.live += delta.live;
    }

    pub fn complete(&self, delta: SessionCounters) {
        let negated = SessionCounters {
            waiting: -delta.waiting,
            loading_models: -delta.loading_models,
            waiting_backends: -delta.waiting_backends,
            live: -delta.live,
        };
        self.session.inner.counters.apply(negated);
        let mut held = self.held.lock().unwrap();
        held.waiting -= delta.waiting;
        held.loading_models -= delta.loading_models;
        held.waiting_backends -= delta.waiting_backends;
        held.live -= delta.live;
    }
}

impl Drop for SessionClaimHandle {
    fn drop(&mut self) {
        let remaining = *self.held.lock().unwrap();
        if remaining != SessionCounters::default() {
            let negated = SessionCounters {
                waiting: -remaining.waiting,
                loading_models: -remaining.loading_models,
                waiting_backends: -remaining.waiting_backends,
                live: -remaining.live,
            };
            self.session.inner.counters.apply(negated);
        }
    }
}

/// Registry of live sessions by id, so components that only have a session
/// id on hand (the scheduler's pressure-entry bookkeeping) can still open
/// claims against the right counters. Sessions are created on first use and
/// never removed automatically; the intake layer is expected to drop its
/// reference and call [`SessionDirectory::forget`] when a connection closes.
#[derive(Clone, Default)]
pub struct SessionDirectory {
    sessions: Arc<DashMap<String, Session>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, id: &str) -> Session {
        self.sessions
            .entry(id.to_owned())
            .or_insert_with(|| Session::new(id))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn forget(&self, id: &str) {
        self.sessions.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_dispose_returns_counters_to_baseline() {
        let session = Session::new("s1");
        {
            let claim = session.claim(SessionCounters {
                waiting: 1,
                ..Default::default()
            });
            assert_eq!(session.counters().waiting, 1);
            claim.extend(SessionCounters {
                live: 1,
                ..Default::default()
            });
            assert_eq!(session.counters().live, 1);
            // dropped here without an explicit complete()
        }
        assert_eq!(session.counters(), SessionCounters::default());
    }

    #[tokio::test]
    async fn interrupt_fires_existing_subscribers_only() {
        let session = Session::new("s1");
        let rx = session.subscribe_cancel().await;
        session.interrupt().await;
        assert!(*rx.borrow(), "pre-existing subscriber observes interrupt");

        let fresh_rx = session.subscribe_cancel().await;
        assert!(!*fresh_rx.borrow(), "new subscriber starts uncancelled");
    }
}
