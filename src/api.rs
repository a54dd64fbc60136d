// =============================================================================
// REST API — status surface and manual trigger (Axum 0.7)
// =============================================================================
//
// All endpoints live under `/api/v1/`. There is no authentication layer:
// the service binds to an operator-controlled host and the core has no
// user-facing surface. CORS stays permissive for dashboard development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::orchestrator::Orchestrator;

/// Build the API router with CORS middleware and shared state.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/run", post(run_cycle))
        .route("/api/v1/errors", get(recent_errors))
        .layer(cors)
        .with_state(orchestrator)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Status snapshot
// =============================================================================

async fn status(State(orch): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orch.state.build_status())
}

// =============================================================================
// Manual trigger
// =============================================================================

#[derive(Serialize)]
struct RunResponse {
    result: String,
}

/// Kick a full cycle. Runs inline so the caller sees the result string;
/// if a cycle is already running the shared flag drops this one.
async fn run_cycle(State(orch): State<Arc<Orchestrator>>) -> impl IntoResponse {
    info!("manual cycle trigger received");
    let result = orch.run_cycle().await;
    Json(RunResponse { result })
}

// =============================================================================
// Recent errors
// =============================================================================

async fn recent_errors(State(orch): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orch.state.recent_errors.read().clone())
}
