//! HTTP and websocket surface

mod error;
mod routes;
mod ws;

pub use error::ApiError;

use crate::config::ServerConfig;
use crate::engine::EngineManager;
use crate::imaging::PortraitStore;
use crate::utils::LatencyStats;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Uploads and attached images travel as request bodies
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state, cheap to clone
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub engines: Arc<EngineManager>,
    pub portraits: Arc<PortraitStore>,
    /// Turn latencies across all sessions
    pub latency: Arc<Mutex<LatencyStats>>,
    active_sessions: Arc<AtomicUsize>,
    started: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, engines: Arc<EngineManager>) -> Self {
        let portraits = PortraitStore::new(config.characters_dir());
        Self {
            config: Arc::new(config),
            engines,
            portraits: Arc::new(portraits),
            latency: Arc::new(Mutex::new(LatencyStats::default())),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            started: Instant::now(),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Count a connected session until the guard is dropped
    fn session_opened(&self) -> SessionGuard {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        SessionGuard(self.active_sessions.clone())
    }
}

struct SessionGuard(Arc<AtomicUsize>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/model-status", get(routes::model_status))
        .route("/api/engines/:kind/load", post(routes::load_engine))
        .route("/api/engines/:kind/unload", post(routes::unload_engine))
        .route("/api/tts", post(routes::synthesize))
        .route("/api/voices", get(routes::voices))
        .route("/api/llm-models", get(routes::llm_models))
        .route("/api/generate-image", post(routes::generate_image))
        .route("/api/explain-image", post(routes::explain_image))
        .route("/api/character/upload", post(routes::upload_character))
        .route("/api/character/generate", post(routes::generate_character))
        .route("/api/character/images", get(routes::character_images))
        .route("/ws", get(ws::ws_upgrade))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
