use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use forgepool_types::{BackendId, RequestId, RuntimeError};
use tracing::{debug, info, warn};

use crate::access::BackendAccess;
use crate::clock::now_millis;
use crate::pressure::{PressureEntry, PressureMap};
use crate::record::BackendRecord;
use crate::registry::BackendRegistry;
use crate::request::{Request, RequestOutcome};
use crate::session::{SessionCounters, SessionDirectory};
use crate::wake::{Waker, WakeListener};

/// Minimum pressure age before a load is committed when more than one
/// loader-capable backend is available, so a freshly-arrived request gets a
/// chance to land on a backend that frees up naturally (spec §4.4.1 step 2).
const DEFER_THRESHOLD_MILLIS: i64 = 1_500;
const MODEL_LOAD_POLL: Duration = Duration::from_millis(100);
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// The single coordinator thread described in spec §4.4. Owns the open
/// request set and the pressure map; everyone else posts work through
/// `submit`/cancellation and observes state through the registry and
/// session counters. Mirrors the teacher's single-dispatch-loop design in
/// `runtime::orchestrator::Orchestrator::run_loop`, generalized from a
/// command channel to a polled open-set scan since requests here don't
/// follow a linear pipeline.
pub struct SchedulerLoop {
    registry: Arc<BackendRegistry>,
    pressure: PressureMap,
    sessions: SessionDirectory,
    open: DashMap<RequestId, Arc<Request>>,
    request_counter: AtomicU64,
    last_progress_millis: AtomicI64,
    waker: Waker,
}

impl SchedulerLoop {
    pub fn new(registry: Arc<BackendRegistry>, sessions: SessionDirectory) -> Arc<Self> {
        let waker = registry.waker();
        Arc::new(Self {
            registry,
            pressure: PressureMap::new(),
            sessions,
            open: DashMap::new(),
            request_counter: AtomicU64::new(0),
            last_progress_millis: AtomicI64::new(now_millis()),
            waker,
        })
    }

    pub fn next_request_id(&self) -> RequestId {
        self.request_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn pressure(&self) -> &PressureMap {
        &self.pressure
    }

    /// Insert a newly-created request into the open set and wake the
    /// scheduler so it's considered on the next tick.
    pub fn submit(&self, request: Arc<Request>) {
        self.open.insert(request.id, request);
        self.waker.wake();
    }

    /// Spawn the background tick loop. Runs until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, mut listener: WakeListener, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                scheduler.tick().await;
                tokio::select! {
                    _ = listener.wait(SCHEDULER_TICK) => {}
                    _ = shutdown.changed() => {}
                }
            }
        });
    }

    async fn tick(&self) {
        self.drain_cancellations().await;

        let mut any_completed = false;
        let ids: Vec<RequestId> = self.open.iter().map(|r| *r.key()).collect();

        for id in ids {
            let Some(request) = self.open.get(&id).map(|r| r.value().clone()) else {
                continue;
            };
            if self.try_find(&request).await {
                any_completed = true;
                self.finish(&request).await;
            }
        }

        let now = now_millis();
        if any_completed {
            self.last_progress_millis.store(now, Ordering::SeqCst);
        } else {
            let stagnant_minutes =
                (now - self.last_progress_millis.load(Ordering::SeqCst)) / 60_000;
            if stagnant_minutes as u64 >= self.registry.config.max_timeout_minutes {
                self.fail_on_stagnation(now).await;
            }
        }
    }

    async fn drain_cancellations(&self) {
        let ids: Vec<RequestId> = self.open.iter().map(|r| *r.key()).collect();
        for id in ids {
            let Some(request) = self.open.get(&id).map(|r| r.value().clone()) else {
                continue;
            };
            if request.is_cancelled() {
                self.open.remove(&id);
                request.complete(RequestOutcome::Cancelled);
                if let Some(model) = request.pressure_ref() {
                    self.pressure.release(&model, id).await;
                }
            }
        }
    }

    async fn fail_on_stagnation(&self, now: i64) {
        if self.registry.config.fail_all_on_stagnation {
            warn!("registry stagnant beyond MaxTimeoutMinutes, failing all open requests");
            let ids: Vec<RequestId> = self.open.iter().map(|r| *r.key()).collect();
            for id in ids {
                if let Some((_, request)) = self.open.remove(&id) {
                    request.complete(RequestOutcome::Failed(RuntimeError::Timeout {
                        model: request.desired_model.clone(),
                        backends_holding: 0,
                    }));
                    if let Some(model) = request.pressure_ref() {
                        self.pressure.release(&model, id).await;
                    }
                }
            }
        } else {
            // Switchable per Design Notes Open Question #2: fail only
            // requests whose own per-request deadline has passed.
            let deadline_millis = self.registry.config.per_request_timeout_minutes as i64 * 60_000;
            let ids: Vec<RequestId> = self.open.iter().map(|r| *r.key()).collect();
            for id in ids {
                let Some(request) = self.open.get(&id).map(|r| r.value().clone()) else {
                    continue;
                };
                if now - request.start_time_millis >= deadline_millis {
                    self.open.remove(&id);
                    request.complete(RequestOutcome::Failed(RuntimeError::Timeout {
                        model: request.desired_model.clone(),
                        backends_holding: 0,
                    }));
                    if let Some(model) = request.pressure_ref() {
                        self.pressure.release(&model, id).await;
                    }
                }
            }
        }
    }

    fn finish(&self, request: &Arc<Request>) {
        self.open.remove(&request.id);
    }

    /// One request's pass through spec §4.4 step 2. Returns `true` once the
    /// request has been granted or failed (it should be considered done and
    /// removed from the open set); the caller has already snapshotted the id.
    async fn try_find(&self, request: &Arc<Request>) -> bool {
        let current = self.registry.all();

        let mut possible: Vec<Arc<BackendRecord>> = Vec::new();
        let mut any_loading_or_waiting = false;
        for r in &current {
            let status = r.status().await;
            if matches!(status, forgepool_types::BackendStatus::Loading | forgepool_types::BackendStatus::Waiting) {
                any_loading_or_waiting = true;
            }
            if r.enabled().await && !r.reserved() && matches!(status, forgepool_types::BackendStatus::Running) {
                possible.push(r.clone());
            }
        }

        if possible.is_empty() && !any_loading_or_waiting {
            request.complete(RequestOutcome::Failed(RuntimeError::NoBackendsAvailable));
            return true;
        }

        possible.retain(|r| request.matches(&r.back_type.id));
        if possible.is_empty() {
            request.complete(RequestOutcome::Failed(RuntimeError::NoMatchingBackend));
            return true;
        }

        let mut available = Vec::new();
        for r in &possible {
            if !r.in_use().await {
                available.push(r.clone());
            }
        }
        // Balance: ascending by usages (spec §5 "prefers backends with lower usages").
        let mut usages_cache = Vec::with_capacity(available.len());
        for r in &available {
            usages_cache.push((r.usages(), r.clone()));
        }
        usages_cache.sort_by_key(|(u, _)| *u);
        let available: Vec<Arc<BackendRecord>> = usages_cache.into_iter().map(|(_, r)| r).collect();

        let now = now_millis();

        if request.desired_model.is_none() {
            if let Some(chosen) = available.first() {
                if chosen.try_acquire(now).await {
                    let access = BackendAccess::new(chosen.clone(), self.waker.clone());
                    request.complete(RequestOutcome::Granted(access));
                    return true;
                }
            }
        } else if let Some(model) = &request.desired_model {
            for candidate in &available {
                if candidate.current_model_name().await.as_deref() == Some(model.as_str())
                    && candidate.try_acquire(now).await
                {
                    let access = BackendAccess::new(candidate.clone(), self.waker.clone());
                    request.complete(RequestOutcome::Granted(access));
                    return true;
                }
            }
            // Not found on any ready backend: register pressure.
            if request.pressure_ref().is_none() {
                let entry = self
                    .pressure
                    .register(
                        model,
                        request.id,
                        request.session.as_ref().map(|s| s.session_id()),
                        now,
                    )
                    .await;
                request.set_pressure_ref(Some(model.clone()));
                if entry.is_loading().await {
                    if let Some(notify) = &request.notify_will_load {
                        notify();
                    }
                }
            }
        }

        if !available.is_empty() {
            self.load_highest_pressure(&available).await;
        }

        false
    }

    /// spec §4.4.1: pick at most one pressure entry and commit a backend to
    /// loading its model.
    async fn load_highest_pressure(&self, available: &[Arc<BackendRecord>]) {
        let available_loaders: Vec<Arc<BackendRecord>> = available
            .iter()
            .filter(|b| b.driver.can_load_models())
            .cloned()
            .collect();
        if available_loaders.is_empty() {
            return;
        }

        let now = now_millis();
        let mut candidates_entries = self.pressure.not_loading_snapshot().await;
        // Sort descending by score; heuristic monotonicity guarantees ties
        // resolve toward the earlier-arriving entry (stable sort on
        // insertion order after scoring).
        let mut scored: Vec<(i64, Arc<PressureEntry>)> = Vec::new();
        for entry in candidates_entries.drain(..) {
            let count = entry.count().await;
            scored.push((entry.score(now, count), entry));
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let loader_ids: HashSet<BackendId> = available_loaders.iter().map(|b| b.id).collect();

        let mut best_all: Option<Arc<PressureEntry>> = None;
        let mut best_any: Option<Arc<PressureEntry>> = None;
        for (_, entry) in &scored {
            let requests = entry.requests().await;
            if requests.is_empty() {
                continue;
            }
            let mut all_compatible = true;
            let mut any_compatible = false;
            for rid in &requests {
                let compatible = match self.open.get(rid) {
                    Some(r) => loader_ids.iter().any(|id| {
                        available_loaders
                            .iter()
                            .find(|b| &b.id == id)
                            .is_some_and(|b| r.matches(&b.back_type.id))
                    }),
                    None => false,
                };
                if compatible {
                    any_compatible = true;
                } else {
                    all_compatible = false;
                }
            }
            if any_compatible && best_any.is_none() {
                best_any = Some(entry.clone());
            }
            if all_compatible && best_all.is_none() {
                best_all = Some(entry.clone());
            }
            if best_all.is_some() {
                break;
            }
        }

        let Some(chosen_entry) = best_all.or(best_any) else {
            return;
        };

        if chosen_entry.is_loading().await {
            return;
        }

        let wait = now - chosen_entry.first_request_time_millis;
        if available_loaders.len() > 1 && wait < DEFER_THRESHOLD_MILLIS {
            return;
        }

        let bad = chosen_entry.bad_backends().await;
        let candidates: Vec<Arc<BackendRecord>> = available_loaders
            .iter()
            .filter(|b| !bad.contains(&b.id))
            .cloned()
            .collect();
        if candidates.is_empty() {
            // Every eligible loader has already failed this model.
            self.fail_all_for_entry(&chosen_entry, RuntimeError::AllBackendsFailedModel {
                model: chosen_entry.model.clone(),
            })
            .await;
            return;
        }

        let mut still_needs_load = Vec::new();
        for c in &candidates {
            if c.current_model_name().await.as_deref() != Some(chosen_entry.model.as_str()) {
                still_needs_load.push(c.clone());
            }
        }
        if still_needs_load.is_empty() {
            // Already loaded everywhere eligible; nothing to do this tick.
            return;
        }

        let zero_usage: Vec<&Arc<BackendRecord>> =
            still_needs_load.iter().filter(|b| b.usages() == 0).collect();
        let pool: Vec<&Arc<BackendRecord>> = if zero_usage.is_empty() {
            still_needs_load.iter().collect()
        } else {
            zero_usage
        };
        let chosen = pool
            .into_iter()
            .min_by_key(|b| b.time_last_release())
            .expect("pool is non-empty")
            .clone();

        chosen_entry.set_is_loading(true).await;
        chosen.set_reserve_model_load(true);

        // Tell every request this entry is already tracking that its model
        // is now committed to load (spec §4.4 step i). This is the only
        // place `isLoading` actually flips to true for these requests; a
        // request that joins an already-loading entry later is notified
        // inline in `try_find` instead.
        for rid in chosen_entry.requests().await {
            if let Some(tracked) = self.open.get(&rid) {
                if let Some(notify) = &tracked.notify_will_load {
                    notify();
                }
            }
        }

        // Session claims are opened so the intake status surface reflects a
        // model load is underway (spec §4.4.1 step 3); disposed once the
        // load resolves.
        let load_claims: Vec<_> = chosen_entry
            .sessions()
            .await
            .into_iter()
            .filter_map(|session_id| self.sessions.get(&session_id))
            .map(|session| {
                session.claim(SessionCounters {
                    loading_models: 1,
                    ..Default::default()
                })
            })
            .collect();

        debug!(model = %chosen_entry.model, backend_id = %chosen.id, "committing model load");

        let registry = self.registry.clone();
        let pressure = self.pressure.clone();
        let entry = chosen_entry.clone();
        let chosen_for_task = chosen.clone();
        let waker = self.waker.clone();
        tokio::spawn(async move {
            let _load_claims = load_claims;
            loop {
                if chosen_for_task.usages() == 0 {
                    break;
                }
                tokio::time::sleep(MODEL_LOAD_POLL).await;
            }
            let ok = chosen_for_task.driver.load_model(&entry.model).await;
            if ok {
                chosen_for_task
                    .set_current_model_name(Some(entry.model.clone()))
                    .await;
            }
            chosen_for_task.set_reserve_model_load(false);
            entry.set_is_loading(false).await;

            let resident = chosen_for_task.current_model_name().await;
            if resident.as_deref() != Some(entry.model.as_str()) {
                entry.mark_bad_backend(chosen_for_task.id).await;
                warn!(backend_id = %chosen_for_task.id, model = %entry.model, "model load did not take effect");
            } else {
                info!(backend_id = %chosen_for_task.id, model = %entry.model, "model load committed");
            }

            let _ = registry.loaded_models().await;
            let _ = pressure.get(&entry.model);
            waker.wake();
        });
    }

    async fn fail_all_for_entry(&self, entry: &Arc<PressureEntry>, error: RuntimeError) {
        for rid in entry.requests().await {
            if let Some((_, request)) = self.open.remove(&rid) {
                request.complete(RequestOutcome::Failed(error.clone()));
            }
        }
        self.pressure.clear(&entry.model);
    }
}
