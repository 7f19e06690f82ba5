//! Aido MCP backend library.
//!
//! This module exposes the application builder for use in tests.

use aido_types::{MCP_LAST_EVENT_ID_HEADER, MCP_SESSION_ID_HEADER};
use axum::http::HeaderValue;
use axum::http::{header, HeaderName, Method};
use axum::{routing::get, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

pub mod api;
pub mod config;
pub mod error;
pub mod mcp;
pub mod state;

use config::Config;
use state::AppState;

/// Create the Axum application router with default configuration.
///
/// This function is used both by the main server binary and by integration tests.
pub async fn create_app() -> Router {
    create_app_with_config(&Config::default()).await
}

/// Create the Axum application router for a configuration.
pub async fn create_app_with_config(config: &Config) -> Router {
    create_app_with_state(AppState::new(config), config.cors_allowed_origins.clone()).await
}

/// Create the Axum application router with a given state and CORS origins.
///
/// If `cors_allowed_origins` is empty, any origin is allowed.
/// Otherwise, only the specified origins are allowed.
pub async fn create_app_with_state(state: AppState, cors_allowed_origins: Vec<String>) -> Router {
    let endpoint = state.mcp_config().endpoint.clone();
    info!("MCP endpoint mounted at {}", endpoint);

    let session_header = HeaderName::from_static(MCP_SESSION_ID_HEADER);
    let last_event_header = HeaderName::from_static(MCP_LAST_EVENT_ID_HEADER);

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            session_header.clone(),
            last_event_header,
        ])
        .expose_headers([session_header]);

    // If no origins specified, allow any origin
    // Otherwise, restrict to the specified origins
    let cors = if cors_allowed_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_allowed_origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        cors.allow_origin(origins)
    };

    Router::new()
        .route("/health", get(health))
        .route(
            &endpoint,
            get(api::mcp::mcp_get)
                .post(api::mcp::mcp_post)
                .delete(api::mcp::mcp_delete),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health() -> &'static str {
    "OK"
}

/// Periodically close sessions that have been idle too long.
///
/// Returns `None` when idle reaping is disabled. The task stops when
/// `shutdown` is cancelled.
pub fn spawn_session_reaper(state: AppState, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
    let max_idle = state.mcp_config().session_idle_timeout()?;
    let interval = state.mcp_config().reaper_interval();
    info!(
        "Idle MCP sessions are closed after {}s (checked every {}s)",
        max_idle.as_secs(),
        interval.as_secs()
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    state.reap_idle_sessions().await;
                }
            }
        }
        debug!("Session reaper stopped");
    }))
}
