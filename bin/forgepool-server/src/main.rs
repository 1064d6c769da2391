//! forgepool-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Build the dispatch core, register the process-backend driver type,
//!    load the persisted registry file.
//! 4. Start the init worker and scheduler tick loop.
//! 5. Build the Axum router and start the HTTP server with graceful
//!    shutdown, which also drains every backend cleanly.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use forgepool_core::{Core, RegistryConfig};
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: FORGEPOOL_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "forgepool-server starting");
    if cfg.admin_api_token.is_none() {
        warn!("FORGEPOOL_ADMIN_TOKEN is not set; /admin routes are unauthenticated");
    }

    // ── 3. Dispatch core ─────────────────────────────────────────────────
    let registry_config: RegistryConfig = cfg.registry_config();
    let (core, listener) = Core::new(registry_config);
    core.registry
        .register_type(Arc::new(forgepool_driver_process::ProcessDriverFactory));
    core.registry.load(&cfg.registry_file).await;
    info!(path = %cfg.registry_file, "backend registry loaded");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    core.spawn(listener, shutdown_rx);
    info!("init worker and scheduler started");

    // ── 4. Shared application state ───────────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        registry: core.registry.clone(),
        scheduler: core.scheduler.clone(),
        sessions: core.sessions.clone(),
    });

    // ── 5. HTTP server with graceful shutdown ─────────────────────────────
    let app = routes::build(state.clone());
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    core.registry.shutdown().await;
    if let Err(e) = core.registry.save(&cfg.registry_file).await {
        warn!(error = %e, "failed to persist registry file on shutdown");
    }

    info!("forgepool-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
