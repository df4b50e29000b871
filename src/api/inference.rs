use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::Json,
};

use super::AppState;
use crate::{
    error::Result,
    inference::{
        BatchPredictionRequest, BatchPredictionResponse, DeploymentHealth, PredictionRequest,
        PredictionResponse, SchemaResponse,
    },
    security::CallerContext,
};

/// Predict for up to 1000 instances against a deployment.
pub async fn predict(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(deployment): Path<String>,
    body: std::result::Result<Json<PredictionRequest>, JsonRejection>,
) -> Result<Json<PredictionResponse>> {
    let Json(request) = body?;
    tracing::info!(
        deployment = %deployment,
        client_id = caller.rate_limit_id(),
        instances = request.instances.len(),
        "📨 Prediction request"
    );
    let response = state.orchestrator.predict(&caller, &deployment, request).await?;
    Ok(Json(response))
}

/// Predict for up to 10000 instances. Per-instance failures stay in the
/// response unless `fail_on_error` is set.
pub async fn predict_batch(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(deployment): Path<String>,
    body: std::result::Result<Json<BatchPredictionRequest>, JsonRejection>,
) -> Result<Json<BatchPredictionResponse>> {
    let Json(request) = body?;
    tracing::info!(
        deployment = %deployment,
        client_id = caller.rate_limit_id(),
        instances = request.instances.len(),
        "📦 Batch prediction request"
    );
    let response = state
        .orchestrator
        .predict_batch(&caller, &deployment, request)
        .await?;
    Ok(Json(response))
}

pub async fn deployment_health(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(deployment): Path<String>,
) -> Result<Json<DeploymentHealth>> {
    Ok(Json(state.orchestrator.health(&caller, &deployment).await?))
}

pub async fn deployment_schema(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(deployment): Path<String>,
) -> Result<Json<SchemaResponse>> {
    Ok(Json(state.orchestrator.schema(&caller, &deployment).await?))
}
