//! Tavern proxy HTTP server.
//!
//! Serves `/v1/models` and `/v1/chat/completions` on top of
//! [`CompletionService`]; everything else answers 404.

pub mod api;
pub mod cli;
pub mod logging;

use anyhow::Context;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use std::time::Duration;
use tavern_proxy_ai_adapters::HordeState;
use tavern_proxy_core::{
    load_token_counter, BackendDispatcher, CompletionService, ProxyConfig, TokenCounter,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const HORDE_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CompletionService>,
}

impl AppState {
    pub fn new(service: Arc<CompletionService>) -> Self {
        Self { service }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(api::list_models))
        .route("/v1/chat/completions", post(api::chat_completions))
        .fallback(api::not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::preflight_and_cors,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Keeps the Horde status, model and worker lists fresh for the lifetime of
/// the process. The first refresh runs immediately.
fn spawn_horde_refresh(dispatcher: &BackendDispatcher) {
    let client = dispatcher.horde_client();
    let state = dispatcher.horde_state();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HORDE_REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = state.refresh(&client).await {
                warn!("Horde refresh failed: {:#}", e);
            }
        }
    });
}

pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let tokenizer: Arc<dyn TokenCounter> = Arc::from(load_token_counter(&config.tokenizer_path));
    let dispatcher = Arc::new(BackendDispatcher::new(
        config.clone(),
        Arc::new(HordeState::new()),
    ));
    if config.horde.enable {
        spawn_horde_refresh(&dispatcher);
    }

    let service = CompletionService::new(config.clone(), dispatcher, tokenizer)
        .context("Failed to initialize completion service")?;
    info!(
        "Prompt format: {}, max context: {}, max new tokens: {}",
        config.prompt_format, config.max_context_length, config.max_new_tokens
    );
    let app = build_router(AppState::new(Arc::new(service)));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Tavern proxy listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
