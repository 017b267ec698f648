//! HTTP API.
//!
//! Management routes live under the versioned base path (`/aog/v0.2`);
//! health and shutdown hooks sit at the root. Handlers stay thin: validate,
//! touch the store, or hand the request to the scheduler.

pub mod invoke;
pub mod model;
pub mod provider;
pub mod response;
pub mod service;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::Router;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{api_base, AppConfig};
use crate::engine::EngineManager;
use crate::error::Result;
use crate::flavor::FlavorRegistry;
use crate::memory::MemoryManager;
use crate::plugin::PluginRegistry;
use crate::provider::ProviderFactory;
use crate::scheduler::Scheduler;
use crate::store::documents::DocumentStore;
use crate::store::Datastore;
use crate::ws::WsConnectionManager;

use response::ok;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Persistent rows.
    pub store: Datastore,
    /// Bundled read-only catalogs.
    pub docs: Arc<DocumentStore>,
    /// Flavor facts.
    pub flavors: FlavorRegistry,
    /// Provider resolution.
    pub providers: Arc<ProviderFactory>,
    /// Plugin runtime.
    pub plugins: Arc<PluginRegistry>,
    /// Model memory manager.
    pub memory: Arc<MemoryManager>,
    /// Request scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Local engine manager.
    pub engines: Arc<EngineManager>,
    /// WebSocket connection registry.
    pub ws: Arc<WsConnectionManager>,
    /// In-flight streamed model pulls, by model name.
    pub pulls: Arc<Mutex<HashMap<String, CancellationToken>>>,
    /// Shutdown hook channel; `POST /_internal/shutdown` signals it.
    pub shutdown_tx: mpsc::Sender<()>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Build the full router: versioned API plus root endpoints.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // services
        .route("/service/install", post(service::install))
        .route("/service", put(service::update).get(service::list))
        .route("/service/export", post(service::export))
        .route("/service/import", post(service::import))
        // service providers
        .route(
            "/service_provider",
            get(provider::list)
                .post(provider::create)
                .put(provider::update)
                .delete(provider::delete),
        )
        // models
        .route(
            "/model",
            get(model::list).post(model::create).delete(model::delete),
        )
        .route("/model/stream", post(model::stream))
        .route("/model/stream/cancel", post(model::stream_cancel))
        .route("/model/recommend", get(model::recommend))
        .route("/model/support", get(model::support))
        // service invocation
        .route(
            "/services/{service}",
            post(invoke::invoke_service).get(invoke::ws_invoke),
        );

    Router::new()
        .nest(&api_base(), api)
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/engine/health", get(engine_health))
        .route("/engine/version", get(engine_version))
        .route("/_internal/shutdown", post(internal_shutdown))
        .with_state(state)
}

/// `GET /health`.
async fn health() -> Result<Response> {
    Ok(ok(serde_json::json!({"status": "ok"})))
}

/// `GET /version`.
async fn version() -> Result<Response> {
    Ok(ok(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "spec_version": crate::config::SPEC_VERSION,
    })))
}

/// `GET /engine/health`.
async fn engine_health(State(state): State<AppState>) -> Result<Response> {
    Ok(ok(state.engines.health().await))
}

/// `GET /engine/version`.
async fn engine_version(State(state): State<AppState>) -> Result<Response> {
    Ok(ok(state.engines.versions().await))
}

/// `POST /_internal/shutdown` — the graceful-shutdown hook for platforms
/// without a usable signal.
async fn internal_shutdown(State(state): State<AppState>) -> Result<Response> {
    tracing::info!("Shutdown requested over HTTP");
    let _ = state.shutdown_tx.send(()).await;
    Ok(ok(serde_json::json!({"stopping": true})))
}
