use std::sync::Arc;
use std::time::Duration;

use forgepool_types::RuntimeError;
use tokio::sync::{oneshot, watch};

use crate::access::BackendAccess;
use crate::clock::now_millis;
use crate::driver::GenerateOutcome;
use crate::registry::BackendRegistry;
use crate::request::{BackendFilter, Request, RequestOutcome};
use crate::scheduler::SchedulerLoop;
use crate::session::SessionClaimHandle;

/// Parameters accepted by [`get_next_backend`] and [`get_next_backend_and_generate`]
/// (spec §4.7).
pub struct GetNextBackendParams {
    pub max_wait: Duration,
    pub desired_model: Option<String>,
    pub filter: Option<BackendFilter>,
    pub session: Option<SessionClaimHandle>,
    pub notify_will_load: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Caller-supplied cancellation, already merged with any relevant global
    /// shutdown token (spec §5 "Cancellation").
    pub cancel: watch::Receiver<bool>,
}

/// Waits up to `max_wait` for `outcome_rx` to resolve, translating a timeout
/// into a [`RuntimeError::Timeout`] the way spec §4.7 describes.
async fn wait_for_outcome(
    registry: &Arc<BackendRegistry>,
    desired_model: &Option<String>,
    max_wait: Duration,
    outcome_rx: oneshot::Receiver<RequestOutcome>,
) -> RequestOutcome {
    match tokio::time::timeout(max_wait, outcome_rx).await {
        Ok(Ok(outcome)) => outcome,
        // Sender dropped without completing (shutdown race); treat as
        // cancellation rather than panicking the caller.
        Ok(Err(_)) => RequestOutcome::Cancelled,
        Err(_elapsed) => {
            let backends_holding = registry
                .loaded_models()
                .await
                .get(desired_model.as_deref().unwrap_or_default())
                .map(|v| v.len())
                .unwrap_or(0);
            RequestOutcome::Failed(RuntimeError::Timeout {
                model: desired_model.clone(),
                backends_holding,
            })
        }
    }
}

/// The consumer-facing contract of the core (spec §4.7). Creates a
/// [`Request`], inserts it into the scheduler's open set, and waits up to
/// `max_wait` for a terminal outcome.
pub async fn get_next_backend(
    registry: &Arc<BackendRegistry>,
    scheduler: &Arc<SchedulerLoop>,
    params: GetNextBackendParams,
) -> Result<Option<BackendAccess>, RuntimeError> {
    if registry.is_shutting_down() {
        return Err(RuntimeError::ShuttingDown);
    }

    let id = scheduler.next_request_id();
    let (request, outcome_rx) = Request::new(
        id,
        params.desired_model.clone(),
        params.filter,
        params.session,
        params.notify_will_load,
        now_millis(),
        params.cancel,
    );
    let request = Arc::new(request);
    scheduler.submit(request.clone());

    let outcome = wait_for_outcome(registry, &params.desired_model, params.max_wait, outcome_rx).await;

    // Always, on exit, decrement this request's pressure entry (spec §4.7).
    if let Some(model) = request.pressure_ref() {
        scheduler.pressure().release(&model, id).await;
    }

    match outcome {
        RequestOutcome::Granted(access) => Ok(Some(access)),
        RequestOutcome::Failed(err) => Err(err),
        RequestOutcome::Cancelled => Ok(None),
    }
}

/// Like [`get_next_backend`], but also drives one generation attempt via
/// `generate` and owns the request's one-shot redirect budget (spec §7:
/// "the scheduler treats this as a recoverable miss and re-queues once").
///
/// On `PleaseRedirect`, the *same* request (and its `can_redirect` bit) is
/// requeued against the scheduler for a second acquisition; a second
/// `PleaseRedirect` is surfaced as a plain generation failure rather than
/// retried again, matching spec §7's "further redirects are treated as a
/// normal failure".
pub async fn get_next_backend_and_generate<G, Fut, T>(
    registry: &Arc<BackendRegistry>,
    scheduler: &Arc<SchedulerLoop>,
    params: GetNextBackendParams,
    mut generate: G,
) -> Result<Option<T>, RuntimeError>
where
    G: FnMut(&BackendAccess) -> Fut,
    Fut: std::future::Future<Output = Result<T, GenerateOutcome>>,
{
    if registry.is_shutting_down() {
        return Err(RuntimeError::ShuttingDown);
    }

    let id = scheduler.next_request_id();
    let (request, mut outcome_rx) = Request::new(
        id,
        params.desired_model.clone(),
        params.filter,
        params.session,
        params.notify_will_load,
        now_millis(),
        params.cancel,
    );
    let request = Arc::new(request);
    scheduler.submit(request.clone());

    let result = loop {
        let outcome = wait_for_outcome(registry, &params.desired_model, params.max_wait, outcome_rx).await;

        let access = match outcome {
            RequestOutcome::Granted(access) => access,
            RequestOutcome::Failed(err) => break Err(err),
            RequestOutcome::Cancelled => break Ok(None),
        };

        match generate(&access).await {
            Ok(value) => break Ok(Some(value)),
            Err(GenerateOutcome::Redirect(reason)) => match request.requeue_for_redirect() {
                Some(new_rx) => {
                    drop(access);
                    outcome_rx = new_rx;
                    scheduler.submit(request.clone());
                    continue;
                }
                None => {
                    break Err(RuntimeError::GenerationFailed {
                        backend_id: access.backend_id(),
                        message: reason.to_string(),
                    });
                }
            },
            Err(GenerateOutcome::Failed(e)) => {
                break Err(RuntimeError::GenerationFailed {
                    backend_id: access.backend_id(),
                    message: e.to_string(),
                });
            }
        }
    };

    // Always, on exit, decrement this request's pressure entry (spec §4.7).
    if let Some(model) = request.pressure_ref() {
        scheduler.pressure().release(&model, id).await;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BackendDriver, DriverCapabilities, GenerateOutcome, InitError};
    use crate::registry::{BackendFactory, RegistryConfig};
    use crate::session::SessionDirectory;
    use crate::wake::Waker;
    use async_trait::async_trait;
    use forgepool_types::BackendTypeDescriptor;

    struct InstantDriver;

    #[async_trait]
    impl BackendDriver for InstantDriver {
        async fn init(&self) -> Result<DriverCapabilities, InitError> {
            Ok(DriverCapabilities {
                can_load_models: false,
                max_usages: 1,
                ..Default::default()
            })
        }
        async fn shutdown_now(&self) {}
        async fn load_model(&self, _model: &str) -> bool {
            true
        }
        async fn generate_live(
            &self,
            _input: serde_json::Value,
            _batch_id: u64,
            _on_event: &mut (dyn FnMut(crate::driver::GenerationEvent) + Send),
        ) -> Result<(), GenerateOutcome> {
            Ok(())
        }
        fn can_load_models(&self) -> bool {
            false
        }
    }

    struct InstantFactory;

    impl BackendFactory for InstantFactory {
        fn descriptor(&self) -> BackendTypeDescriptor {
            BackendTypeDescriptor {
                id: "instant".into(),
                display_name: "Instant".into(),
                settings_schema: vec![],
                fast_load: true,
            }
        }
        fn create(&self, _settings: &serde_json::Value) -> Arc<dyn BackendDriver> {
            Arc::new(InstantDriver)
        }
    }

    #[tokio::test]
    async fn single_request_idle_backend_acquires_within_a_tick() {
        let (waker, listener) = Waker::new();
        let registry = BackendRegistry::new(RegistryConfig::default(), waker);
        registry.register_type(Arc::new(InstantFactory));
        registry.spawn_init_worker();
        let record = registry
            .add("instant", "t1".into(), serde_json::json!({}), true)
            .await
            .unwrap();

        for _ in 0..50 {
            if matches!(record.status().await, forgepool_types::BackendStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let scheduler = SchedulerLoop::new(registry.clone(), SessionDirectory::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        scheduler.spawn(listener, shutdown_rx);

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let access = get_next_backend(
            &registry,
            &scheduler,
            GetNextBackendParams {
                max_wait: Duration::from_secs(2),
                desired_model: None,
                filter: None,
                session: None,
                notify_will_load: None,
                cancel: cancel_rx,
            },
        )
        .await
        .unwrap();

        assert!(access.is_some());
        assert_eq!(record.usages(), 1);
        drop(access);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(record.usages(), 0);
    }
}
