// ADMIN ENDPOINTS: Rate limit and model cache administration
//
// All routes require the `admin` permission. Limiter backend failures are
// surfaced as internal errors here; only the admission path fails open.

use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AppState;
use crate::{
    error::{Error, Result},
    models::LoadedModelInfo,
    security::{
        BatchLimitOverrides, CallerContext, LimitOverrides, LimiterBackendError, Permission, Tier,
        ViolationSummary,
    },
};

const DEFAULT_OVERRIDE_TTL_HOURS: u64 = 24;

fn backend(e: LimiterBackendError) -> Error {
    Error::Internal(format!("rate limit store: {e}"))
}

#[derive(Debug, Deserialize)]
pub struct DeploymentQuery {
    pub deployment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ViolationsQuery {
    #[serde(default = "default_hours")]
    pub hours: u64,
}

fn default_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize)]
pub struct CustomLimitsRequest {
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub limits: LimitOverrides,
    pub batch_limits: Option<BatchLimitOverrides>,
    pub tier: Option<Tier>,
    pub ttl_hours: Option<u64>, // 0 keeps the override until removed
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub client_id: String,
    pub removed_counters: usize,
}

pub async fn rate_limit_status(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(client_id): Path<String>,
    Query(query): Query<DeploymentQuery>,
) -> Result<Json<Value>> {
    caller.require(Permission::Admin)?;
    let limiter = state.orchestrator.limiter();
    let tier = limiter.client_tier(&client_id).await.map_err(backend)?;
    let windows = limiter
        .status(&client_id, query.deployment_id.as_deref())
        .await;

    Ok(Json(json!({
        "client_id": client_id,
        "deployment_id": query.deployment_id,
        "tier": tier,
        "windows": windows,
        "metrics": limiter.metrics(),
    })))
}

pub async fn set_custom_limits(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(client_id): Path<String>,
    body: std::result::Result<Json<CustomLimitsRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    caller.require(Permission::Admin)?;
    let Json(request) = body?;
    let limiter = state.orchestrator.limiter();
    let ttl = match request.ttl_hours.unwrap_or(DEFAULT_OVERRIDE_TTL_HOURS) {
        0 => None,
        hours => Some(Duration::from_secs(hours * 3600)),
    };
    let deployment_id = request.deployment_id.as_deref();

    if !request.limits.is_empty() {
        limiter
            .set_custom_limits(&client_id, deployment_id, request.limits.clone(), ttl)
            .await
            .map_err(backend)?;
    }
    if let Some(batch) = &request.batch_limits {
        limiter
            .set_custom_batch_limits(&client_id, deployment_id, batch.clone(), ttl)
            .await
            .map_err(backend)?;
    }
    if let Some(tier) = request.tier {
        limiter
            .set_client_tier(&client_id, Some(tier))
            .await
            .map_err(backend)?;
    }

    Ok(Json(json!({
        "client_id": client_id,
        "deployment_id": request.deployment_id,
        "limits": request.limits,
        "batch_limits": request.batch_limits,
        "tier": request.tier,
        "ttl_hours": ttl.map(|ttl| ttl.as_secs() / 3600),
    })))
}

pub async fn remove_custom_limits(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(client_id): Path<String>,
    Query(query): Query<DeploymentQuery>,
) -> Result<Json<Value>> {
    caller.require(Permission::Admin)?;
    let removed = state
        .orchestrator
        .limiter()
        .remove_custom_limits(&client_id, query.deployment_id.as_deref())
        .await
        .map_err(backend)?;
    Ok(Json(json!({ "client_id": client_id, "removed": removed })))
}

pub async fn reset_limits(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(client_id): Path<String>,
) -> Result<Json<ResetResponse>> {
    caller.require(Permission::Admin)?;
    let removed_counters = state
        .orchestrator
        .limiter()
        .reset_client_limits(&client_id)
        .await
        .map_err(backend)?;
    Ok(Json(ResetResponse {
        client_id,
        removed_counters,
    }))
}

pub async fn violations(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(client_id): Path<String>,
    Query(query): Query<ViolationsQuery>,
) -> Result<Json<ViolationSummary>> {
    caller.require(Permission::Admin)?;
    let summary = state
        .orchestrator
        .limiter()
        .violations_summary(&client_id, query.hours)
        .await
        .map_err(backend)?;
    Ok(Json(summary))
}

pub async fn loaded_models(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Result<Json<Value>> {
    caller.require(Permission::Admin)?;
    let models = state.orchestrator.models();
    let loaded: Vec<LoadedModelInfo> = models.loaded_models();
    Ok(Json(json!({
        "models": loaded,
        "memory": models.memory_usage(None),
        "stats": models.stats(),
    })))
}

pub async fn unload_model(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(version_id): Path<String>,
) -> Result<Json<Value>> {
    caller.require(Permission::Admin)?;
    // The artifact is unchanged, so cached responses stay valid; only
    // reload replaces the predictor they were computed with.
    let unloaded = state.orchestrator.models().unload(&version_id);
    if !unloaded {
        return Err(Error::ModelNotFound(version_id));
    }
    tracing::info!(model_version_id = %version_id, "🗑️ Model unloaded by admin");
    Ok(Json(json!({ "model_version_id": version_id, "unloaded": true })))
}

pub async fn reload_model(
    State(state): State<AppState>,
    caller: CallerContext,
    Path(version_id): Path<String>,
) -> Result<Json<Value>> {
    caller.require(Permission::Admin)?;
    let lease = state.orchestrator.models().reload(&version_id).await?;
    // Cached responses may have come from the previous artifact.
    let dropped = match state.orchestrator.response_cache() {
        Some(cache) => cache.clear().await,
        None => 0,
    };
    tracing::info!(
        model_version_id = %version_id,
        content_hash = lease.content_hash(),
        dropped_responses = dropped,
        "🔄 Model reloaded by admin"
    );
    Ok(Json(json!({
        "model_version_id": version_id,
        "framework": lease.framework(),
        "content_hash": lease.content_hash(),
        "dropped_cached_responses": dropped,
    })))
}
