// ARCHITECTURE: API Module - HTTP Surface over the Inference Core
//
// API STRUCTURE:
// 1. INFERENCE (inference.rs): deployment-scoped prediction endpoints
//    - POST /api/v1/inference/{deployment}: single request, response-cached
//    - POST /api/v1/inference/{deployment}/batch: chunked, per-instance errors
//    - GET  /api/v1/inference/{deployment}/health and /schema
//
// 2. ADMIN (admin.rs): limiter and model cache administration
//    - /api/v1/rate-limits/{client}: status, custom limits, reset, violations
//    - /api/v1/models: resident models, unload, reload
//
// 3. HEALTH (health.rs): service liveness
//
// Handlers stay thin: caller identity comes from the `CallerContext`
// extractor and every failure converts through `Error`'s `IntoResponse`.

pub mod admin;
pub mod health;
pub mod inference;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use crate::inference::InferenceOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<InferenceOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<InferenceOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/inference/{deployment}", post(inference::predict))
        .route("/api/v1/inference/{deployment}/batch", post(inference::predict_batch))
        .route("/api/v1/inference/{deployment}/health", get(inference::deployment_health))
        .route("/api/v1/inference/{deployment}/schema", get(inference::deployment_schema))
        .route("/api/v1/rate-limits/{client}", get(admin::rate_limit_status))
        .route(
            "/api/v1/rate-limits/{client}/custom",
            put(admin::set_custom_limits).delete(admin::remove_custom_limits),
        )
        .route("/api/v1/rate-limits/{client}/reset", post(admin::reset_limits))
        .route("/api/v1/rate-limits/{client}/violations", get(admin::violations))
        .route("/api/v1/models/loaded", get(admin::loaded_models))
        .route("/api/v1/models/{version_id}", delete(admin::unload_model))
        .route("/api/v1/models/{version_id}/reload", post(admin::reload_model))
        .with_state(state)
}
