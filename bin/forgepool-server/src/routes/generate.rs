//! Submits a generation request against the dispatch core (spec §4.7
//! `getNextBackend` plus a driven `generateLive` call).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use forgepool_core::{GenerationEvent, GetNextBackendParams};
use tokio::sync::watch;

use crate::error::ServerError;
use crate::schemas::{GenerateRequest, GenerateResponse, GenerationEventDto};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/generate", post(submit_generate))
}

/// `POST /v1/generate`.
///
/// Acquires a backend via `getNextBackend` and drives `generateLive` on it.
/// The one-shot redirect budget (spec §7) lives on the core's `Request` and
/// is enforced by `get_next_backend_and_generate`, not here.
pub async fn submit_generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ServerError> {
    let session = state.sessions.get_or_create(&req.session_id);
    let max_wait = Duration::from_millis(req.max_wait_millis);
    let claim = session.claim(forgepool_core::SessionCounters {
        waiting: 1,
        ..Default::default()
    });
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let mut events = Vec::new();
    let outcome = forgepool_core::get_next_backend_and_generate(
        &state.registry,
        &state.scheduler,
        GetNextBackendParams {
            max_wait,
            desired_model: req.model.clone(),
            filter: None,
            session: Some(claim),
            notify_will_load: None,
            cancel: cancel_rx,
        },
        |access| {
            let input = req.input.clone();
            let backend_id = access.backend_id();
            let driver = access.driver().clone();
            let events = &mut events;
            async move {
                driver
                    .generate_live(input, backend_id.0 as u64, &mut |event| match event {
                        GenerationEvent::Progress { step, total } => {
                            events.push(GenerationEventDto::Progress { step, total });
                        }
                        GenerationEvent::Image { bytes } => {
                            events.push(GenerationEventDto::Image {
                                bytes_base64: BASE64.encode(&bytes[..]),
                            });
                        }
                    })
                    .await
                    .map(|()| backend_id)
            }
        },
    )
    .await?;

    let Some(backend_id) = outcome else {
        return Err(ServerError::BadRequest(
            "request was cancelled before a backend became available".to_string(),
        ));
    };

    Ok(Json(GenerateResponse {
        backend_id: backend_id.0,
        events,
    }))
}
