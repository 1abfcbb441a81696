//! HTTP surface.
//!
//! | Route                         | Handler                |
//! |-------------------------------|------------------------|
//! | `POST /api/analyze`           | [`analyze::analyze`]   |
//! | `GET /api/logs/:runId/stream` | [`logs::stream`]       |
//! | `POST /api/logs/:runId/emit`  | [`logs::emit`]         |
//! | `GET /api/healthcheck`        | [`health::check`]      |

pub mod analyze;
pub mod error;
pub mod health;
pub mod logs;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use consensus::{ActivityBus, Orchestrator, SharedActivityBus, SharedBackend};

use crate::config::AppConfig;

pub use error::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: SharedActivityBus,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Wire a fresh activity bus between the backend's orchestrator and the
    /// feed routes.
    pub fn new(backend: SharedBackend, config: AppConfig) -> Self {
        let bus = ActivityBus::with_config(config.bus.clone()).shared();
        let orchestrator = Orchestrator::new(backend).with_bus(bus.clone());
        Self {
            orchestrator: Arc::new(orchestrator),
            bus,
            config: Arc::new(config),
        }
    }

    pub fn is_production(&self) -> bool {
        self.config.server.environment.is_production()
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit;
    Router::new()
        .route(
            "/api/analyze",
            post(analyze::analyze).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/logs/:run_id/stream", get(logs::stream))
        .route("/api/logs/:run_id/emit", post(logs::emit))
        .route("/api/healthcheck", get(health::check))
        .with_state(state)
}
