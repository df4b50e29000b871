// ARCHITECTURE: Inference Orchestrator - The Request Path
//
// DESIGN PHILOSOPHY:
// Every prediction walks the same stages, each logged with the request id:
//   Received -> Admitted -> ModelResolved -> InputValidated -> Predicted
//   -> Postprocessed -> Responded
// and leaves early through exactly one of RejectedRateLimit, ModelUnavailable,
// ValidationFailed or PredictionFailed.
//
// BATCH SEMANTICS:
// - Instances are validated one by one; failures are recorded at their index
// - Valid instances are predicted in chunks of `batch_size`
// - A failing chunk is retried instance by instance so only the offending
//   instances carry errors
// - `fail_on_error` turns the first failure into a failure of the whole call
//
// PRODUCTION REQUIREMENTS MET:
// ✅ Limiter admission before any model work
// ✅ Predictions run on the blocking pool while holding a lease
// ✅ Identical single requests served from the response cache

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    deployment::{Deployment, DeploymentResolver},
    response_cache::ResponseCache,
    schema::{InstanceValidator, ModelSchema},
    types::{
        BatchMetadata, BatchPredictionRequest, BatchPredictionResponse, DeploymentHealth,
        HealthStatus, ModelInfo, PredictionMetadata, PredictionRequest, PredictionResponse,
        PredictionResult, SchemaResponse, MAX_BATCH_SIZE, MAX_INSTANCES_PER_BATCH,
        MAX_INSTANCES_PER_REQUEST,
    },
};
use crate::{
    error::{Error, Result},
    models::{FeatureRow, ModelCache, ModelLease, RawPrediction},
    security::{CallerContext, EndpointClass, Permission, RateLimitResult, RateLimiter},
};

// CONFIGURATION: OrchestratorConfig - Request Bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub default_batch_size: usize, // Chunk size when the request sets none (default: 100)
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Admitted,
    ModelResolved,
    InputValidated,
    Predicted,
    Postprocessed,
    Responded,
    RejectedRateLimit,
    ModelUnavailable,
    ValidationFailed,
    PredictionFailed,
}

impl RequestStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStage::Received => "received",
            RequestStage::Admitted => "admitted",
            RequestStage::ModelResolved => "model_resolved",
            RequestStage::InputValidated => "input_validated",
            RequestStage::Predicted => "predicted",
            RequestStage::Postprocessed => "postprocessed",
            RequestStage::Responded => "responded",
            RequestStage::RejectedRateLimit => "rejected_rate_limit",
            RequestStage::ModelUnavailable => "model_unavailable",
            RequestStage::ValidationFailed => "validation_failed",
            RequestStage::PredictionFailed => "prediction_failed",
        }
    }
}

fn stage(request_id: &str, deployment: &str, stage: RequestStage) {
    debug!(request_id = %request_id, deployment = %deployment, stage = stage.as_str(), "Request stage");
}

// CORE SYSTEM: InferenceOrchestrator - Composes Limiter, Cache and Predictors
pub struct InferenceOrchestrator {
    config: OrchestratorConfig,
    deployments: Arc<dyn DeploymentResolver>,
    models: Arc<ModelCache>,
    limiter: Arc<RateLimiter>,
    responses: Option<Arc<ResponseCache>>,
}

impl InferenceOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        deployments: Arc<dyn DeploymentResolver>,
        models: Arc<ModelCache>,
        limiter: Arc<RateLimiter>,
        responses: Option<Arc<ResponseCache>>,
    ) -> Self {
        Self {
            config,
            deployments,
            models,
            limiter,
            responses,
        }
    }

    pub fn models(&self) -> &Arc<ModelCache> {
        &self.models
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn response_cache(&self) -> Option<&Arc<ResponseCache>> {
        self.responses.as_ref()
    }

    // ENDPOINT: Single prediction
    pub async fn predict(
        &self,
        caller: &CallerContext,
        deployment_name: &str,
        request: PredictionRequest,
    ) -> Result<PredictionResponse> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        stage(&request_id, deployment_name, RequestStage::Received);

        caller.require(Permission::Inference)?;
        if request.instances.is_empty() || request.instances.len() > MAX_INSTANCES_PER_REQUEST {
            stage(&request_id, deployment_name, RequestStage::ValidationFailed);
            return Err(Error::Validation(format!(
                "instances must hold between 1 and {MAX_INSTANCES_PER_REQUEST} items"
            )));
        }

        let deployment = self.resolve_active(deployment_name).await?;
        self.admit(
            &request_id,
            &deployment,
            self.limiter
                .check(caller.rate_limit_id(), Some(deployment.id.as_str()), EndpointClass::Inference)
                .await,
        )?;

        let cache_key = ResponseCache::cache_key(&deployment.id, &request.instances);
        if request.use_cache {
            if let Some(cache) = &self.responses {
                if let Some(mut cached) = cache.get(&cache_key).await {
                    cached.metadata = PredictionMetadata {
                        request_id: request_id.clone(),
                        latency_ms: elapsed_ms(started),
                        cached: true,
                        timestamp: Utc::now(),
                        prediction_count: cached.predictions.len(),
                    };
                    shape_probabilities(&mut cached.predictions, request.return_probabilities);
                    stage(&request_id, &deployment.id, RequestStage::Responded);
                    self.note_request(&deployment).await;
                    return Ok(cached);
                }
            }
        }

        let lease = self.lease_model(&request_id, &deployment).await?;

        let schema = deployment.model_schema.clone().unwrap_or_default();
        let validator = InstanceValidator::new(&schema)?;
        let mut rows = Vec::with_capacity(request.instances.len());
        for (index, instance) in request.instances.iter().enumerate() {
            let row = validator
                .validate(index, instance)
                .and_then(|row| preprocess(&schema, row))
                .map_err(|message| {
                    stage(&request_id, &deployment.id, RequestStage::ValidationFailed);
                    Error::Validation(message)
                })?;
            rows.push(row);
        }
        stage(&request_id, &deployment.id, RequestStage::InputValidated);

        let outputs = run_prediction(&lease, rows).await.inspect_err(|e| {
            stage(&request_id, &deployment.id, RequestStage::PredictionFailed);
            warn!(request_id = %request_id, error = %e, "Prediction failed");
        })?;
        stage(&request_id, &deployment.id, RequestStage::Predicted);

        let classes = class_names(&deployment, &lease);
        let mut predictions: Vec<PredictionResult> = outputs
            .into_iter()
            .enumerate()
            .map(|(index, raw)| postprocess(index, raw, classes.as_deref()))
            .collect();
        stage(&request_id, &deployment.id, RequestStage::Postprocessed);

        let mut response = PredictionResponse {
            predictions: predictions.clone(),
            model_info: model_info(&deployment),
            metadata: PredictionMetadata {
                request_id: request_id.clone(),
                latency_ms: elapsed_ms(started),
                cached: false,
                timestamp: Utc::now(),
                prediction_count: predictions.len(),
            },
        };

        // Stored with probabilities so later callers can ask for them.
        if let Some(cache) = &self.responses {
            cache.put(cache_key, response.clone()).await;
        }

        shape_probabilities(&mut predictions, request.return_probabilities);
        response.predictions = predictions;

        self.note_request(&deployment).await;
        stage(&request_id, &deployment.id, RequestStage::Responded);
        info!(
            request_id = %request_id,
            deployment = %deployment.id,
            predictions = response.metadata.prediction_count,
            latency_ms = response.metadata.latency_ms,
            "✅ Prediction completed"
        );
        Ok(response)
    }

    // ENDPOINT: Batch prediction with per-instance failures
    pub async fn predict_batch(
        &self,
        caller: &CallerContext,
        deployment_name: &str,
        request: BatchPredictionRequest,
    ) -> Result<BatchPredictionResponse> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        stage(&request_id, deployment_name, RequestStage::Received);

        caller.require(Permission::BatchInference)?;
        let total = request.instances.len();
        if total == 0 || total > MAX_INSTANCES_PER_BATCH {
            return Err(Error::Validation(format!(
                "instances must hold between 1 and {MAX_INSTANCES_PER_BATCH} items"
            )));
        }
        let batch_size = request.batch_size.unwrap_or(self.config.default_batch_size);
        if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            return Err(Error::Validation(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}"
            )));
        }

        let deployment = self.resolve_active(deployment_name).await?;
        self.admit(
            &request_id,
            &deployment,
            self.limiter
                .check_batch(caller.rate_limit_id(), total, Some(deployment.id.as_str()))
                .await,
        )?;

        let lease = self.lease_model(&request_id, &deployment).await?;

        let schema = deployment.model_schema.clone().unwrap_or_default();
        let validator = InstanceValidator::new(&schema)?;
        let mut results: Vec<Option<PredictionResult>> = vec![None; total];
        let mut valid: Vec<(usize, FeatureRow)> = Vec::with_capacity(total);
        for (index, instance) in request.instances.iter().enumerate() {
            match validator
                .validate(index, instance)
                .and_then(|row| preprocess(&schema, row))
            {
                Ok(row) => valid.push((index, row)),
                Err(message) if request.fail_on_error => {
                    stage(&request_id, &deployment.id, RequestStage::ValidationFailed);
                    return Err(Error::Validation(message));
                }
                Err(message) => results[index] = Some(PredictionResult::failure(index, message)),
            }
        }
        stage(&request_id, &deployment.id, RequestStage::InputValidated);

        let classes = class_names(&deployment, &lease);
        for chunk in valid.chunks(batch_size) {
            let rows: Vec<FeatureRow> = chunk.iter().map(|(_, row)| row.clone()).collect();
            match run_prediction(&lease, rows).await {
                Ok(outputs) => {
                    for ((index, _), raw) in chunk.iter().zip(outputs) {
                        results[*index] = Some(postprocess(*index, raw, classes.as_deref()));
                    }
                }
                Err(e) if request.fail_on_error => {
                    stage(&request_id, &deployment.id, RequestStage::PredictionFailed);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        request_id = %request_id,
                        chunk_len = chunk.len(),
                        error = %e,
                        "Batch chunk failed, retrying instances individually"
                    );
                    for (index, row) in chunk {
                        results[*index] = Some(match run_prediction(&lease, vec![row.clone()]).await {
                            Ok(mut outputs) => match outputs.pop() {
                                Some(raw) => postprocess(*index, raw, classes.as_deref()),
                                None => PredictionResult::failure(*index, "no prediction returned"),
                            },
                            Err(e) => PredictionResult::failure(*index, e.to_string()),
                        });
                    }
                }
            }
        }
        stage(&request_id, &deployment.id, RequestStage::Predicted);

        let mut predictions: Vec<PredictionResult> = results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| PredictionResult::failure(index, "instance was not processed"))
            })
            .collect();
        shape_probabilities(&mut predictions, request.return_probabilities);
        stage(&request_id, &deployment.id, RequestStage::Postprocessed);

        let failed = predictions.iter().filter(|p| p.is_error()).count();
        let successful = total - failed;
        let total_latency_ms = elapsed_ms(started);

        self.note_request(&deployment).await;
        stage(&request_id, &deployment.id, RequestStage::Responded);
        info!(
            request_id = %request_id,
            deployment = %deployment.id,
            total_instances = total,
            failed_predictions = failed,
            latency_ms = total_latency_ms,
            "✅ Batch prediction completed"
        );

        Ok(BatchPredictionResponse {
            predictions,
            model_info: model_info(&deployment),
            metadata: BatchMetadata {
                request_id,
                total_instances: total,
                successful_predictions: successful,
                failed_predictions: failed,
                batch_size,
                total_latency_ms,
                avg_latency_per_instance: total_latency_ms / total as f64,
                success_rate: successful as f64 / total as f64,
                timestamp: Utc::now(),
            },
        })
    }

    // ENDPOINT: Deployment health. Never triggers a load.
    pub async fn health(
        &self,
        caller: &CallerContext,
        deployment_name: &str,
    ) -> Result<DeploymentHealth> {
        caller.require(Permission::Health)?;
        let deployment = self.resolve(deployment_name).await?;

        let model_loaded = self.models.is_loaded(&deployment.model_version_id);
        let model_healthy = model_loaded && self.models.check_health(&deployment.model_version_id);
        let status = if deployment.is_active() && model_healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        Ok(DeploymentHealth {
            status,
            deployment_id: deployment.id.clone(),
            model_loaded,
            details: json!({
                "deployment_status": deployment.status,
                "model_version_id": deployment.model_version_id,
                "framework": deployment.framework,
                "model_healthy": model_healthy,
                "last_request_at": deployment.last_request_at,
                "memory": self.models.memory_usage(Some(&deployment.model_version_id)),
            }),
        })
    }

    // ENDPOINT: Input schema and examples
    pub async fn schema(
        &self,
        caller: &CallerContext,
        deployment_name: &str,
    ) -> Result<SchemaResponse> {
        caller.require(Permission::Schema)?;
        let deployment = self.resolve(deployment_name).await?;
        let schema = deployment
            .model_schema
            .as_ref()
            .ok_or_else(|| Error::SchemaUnavailable(deployment.id.clone()))?;

        Ok(SchemaResponse {
            deployment_id: deployment.id.clone(),
            schema: serde_json::to_value(schema)?,
            examples: schema.examples.clone(),
            description: deployment.description.clone(),
        })
    }

    async fn resolve(&self, name_or_id: &str) -> Result<Deployment> {
        self.deployments
            .resolve(name_or_id)
            .await
            .map_err(|e| Error::Internal(format!("deployment lookup failed: {e:#}")))?
            .ok_or_else(|| Error::DeploymentNotFound(name_or_id.to_string()))
    }

    async fn resolve_active(&self, name_or_id: &str) -> Result<Deployment> {
        let deployment = self.resolve(name_or_id).await?;
        if !deployment.is_active() {
            return Err(Error::DeploymentNotFound(name_or_id.to_string()));
        }
        Ok(deployment)
    }

    fn admit(&self, request_id: &str, deployment: &Deployment, decision: RateLimitResult) -> Result<()> {
        match decision {
            RateLimitResult::RateLimited {
                retry_after_seconds,
                window,
                limit,
                ..
            } => {
                stage(request_id, &deployment.id, RequestStage::RejectedRateLimit);
                Err(Error::RateLimited {
                    window,
                    limit,
                    retry_after_seconds,
                })
            }
            RateLimitResult::Allowed | RateLimitResult::FailedOpen => {
                stage(request_id, &deployment.id, RequestStage::Admitted);
                Ok(())
            }
        }
    }

    async fn lease_model(&self, request_id: &str, deployment: &Deployment) -> Result<ModelLease> {
        let lease = self
            .models
            .get_or_load(&deployment.model_version_id)
            .await
            .inspect_err(|e| {
                stage(request_id, &deployment.id, RequestStage::ModelUnavailable);
                warn!(request_id = %request_id, error = %e, "Model unavailable");
            })?;
        stage(request_id, &deployment.id, RequestStage::ModelResolved);
        Ok(lease)
    }

    async fn note_request(&self, deployment: &Deployment) {
        if let Err(e) = self.deployments.record_request(&deployment.id, Utc::now()).await {
            warn!(deployment = %deployment.id, error = %e, "Failed to record last request time");
        }
    }
}

fn preprocess(schema: &ModelSchema, row: FeatureRow) -> std::result::Result<FeatureRow, String> {
    match &schema.preprocessing {
        Some(spec) => spec.apply(row),
        None => Ok(row),
    }
}

// Predictions run on the blocking pool; the cloned lease keeps the model
// alive even if it is evicted meanwhile.
async fn run_prediction(lease: &ModelLease, rows: Vec<FeatureRow>) -> Result<Vec<RawPrediction>> {
    let lease = lease.clone();
    let expected = rows.len();
    let outputs = tokio::task::spawn_blocking(move || lease.predict(&rows))
        .await
        .map_err(|e| Error::Inference(format!("prediction task failed: {e}")))?
        .map_err(|e| Error::Inference(format!("{e:#}")))?;
    if outputs.len() != expected {
        return Err(Error::Inference(format!(
            "predictor returned {} outputs for {expected} instances",
            outputs.len()
        )));
    }
    Ok(outputs)
}

fn class_names(deployment: &Deployment, lease: &ModelLease) -> Option<Vec<String>> {
    deployment
        .model_schema
        .as_ref()
        .and_then(|schema| schema.output_schema.classes.clone())
        .or_else(|| lease.info().classes)
}

fn postprocess(index: usize, raw: RawPrediction, classes: Option<&[String]>) -> PredictionResult {
    let mut result = PredictionResult::success(index, raw.value);
    if let Some(probabilities) = raw.probabilities {
        result.confidence = probabilities.iter().copied().reduce(f64::max);
        let named = match classes {
            Some(classes) if classes.len() == probabilities.len() => classes
                .iter()
                .cloned()
                .zip(probabilities)
                .collect(),
            _ => probabilities
                .into_iter()
                .enumerate()
                .map(|(j, p)| (format!("class_{j}"), p))
                .collect(),
        };
        result.probabilities = Some(named);
    }
    result
}

fn shape_probabilities(predictions: &mut [PredictionResult], return_probabilities: bool) {
    if !return_probabilities {
        for prediction in predictions {
            prediction.probabilities = None;
            prediction.confidence = None;
        }
    }
}

fn model_info(deployment: &Deployment) -> ModelInfo {
    ModelInfo {
        deployment_id: deployment.id.clone(),
        deployment_name: deployment.name.clone(),
        model_name: deployment.model_name.clone(),
        version: deployment.version.clone(),
        framework: deployment.framework.clone(),
        model_version_id: deployment.model_version_id.clone(),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}
