//! HTTP server assembly
//!
//! Builds the router over the client-facing proxy endpoints and the admin
//! surface, and owns the shared application state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::admin;
use crate::cache::Cache;
use crate::config::Settings;
use crate::db::Store;
use crate::forward;

/// Shared state handed to every handler
pub struct AppState {
    pub settings: Settings,
    pub store: Store,
    pub cache: Arc<Cache>,
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Public health check
        .route("/health", get(health))
        // Client-facing proxy endpoints, one per upstream family
        .route("/v1/chat/completions", post(forward::chat_completions))
        .route("/v1/responses", post(forward::responses))
        .route("/v1/messages", post(forward::messages))
        // Informational endpoints for authenticated tenants
        .route("/v1/models", get(forward::list_models))
        .route("/v1/account", get(forward::account_snapshot))
        // Admin surface
        .merge(admin::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until ctrl-c. Clean shutdown resolves this future with Ok.
pub async fn serve(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let app = app(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}
