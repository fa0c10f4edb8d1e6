//! relaybot - conversational bot backend
//!
//! Normalizes inbound chat events, applies them to per-conversation state
//! machines and persists the result to a local SQLite file or a remote
//! spreadsheet, with optimistic concurrency either way.

mod api;
mod config;
mod db;
mod normalize;
mod runtime;
mod state_machine;

use api::{create_router, AppState};
use config::{BackendConfig, BotConfig};
use db::Backend;
use runtime::{ConversationManager, DeliveryTarget, Dispatcher, RetryPolicy, WorkerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaybot=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = BotConfig::from_env()?;

    // Storage
    let backend = Backend::open(&config.backend)?;
    match &config.backend {
        BackendConfig::Local { path } => {
            tracing::info!(backend = backend.kind(), path = %path.display(), "Opened state store");
        }
        BackendConfig::Sheet { url, .. } => {
            tracing::info!(backend = backend.kind(), url = %url, "Opened state store");
        }
    }

    // Outbound actions
    let delivery = DeliveryTarget::from_url(config.delivery_url.as_deref(), config.request_timeout)?;
    let delivery_kind = delivery.kind();
    let backend_kind = backend.kind();
    if config.delivery_url.is_none() {
        tracing::warn!("RELAYBOT_DELIVERY_URL not set; outbound actions are only logged");
    }

    let state = AppState::new(
        Arc::new(ConversationManager::new(
            Dispatcher::new(
                Arc::new(backend),
                Arc::new(delivery),
                RetryPolicy::from(config.retry),
                config.request_timeout,
            ),
            WorkerConfig {
                reorder_window: config.reorder_window,
                idle_timeout: config.idle_timeout,
            },
        )),
        backend_kind,
        delivery_kind,
    );
    let manager = Arc::clone(&state.manager);
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "relaybot listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    manager.shutdown();
    Ok(())
}
