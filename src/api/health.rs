use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use super::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let memory = state.orchestrator.models().memory_usage(None);
    let response = json!({
        "status": "healthy",
        "service": "model-serving-core",
        "version": env!("CARGO_PKG_VERSION"),
        "loaded_models": memory.loaded_models_count,
        "available_slots": memory.available_slots,
        "timestamp": chrono::Utc::now().to_rfc3339()
    });

    (StatusCode::OK, Json(response))
}
