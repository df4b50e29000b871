// Request and response shapes for the prediction endpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_INSTANCES_PER_REQUEST: usize = 1_000;
pub const MAX_INSTANCES_PER_BATCH: usize = 10_000;
pub const MAX_BATCH_SIZE: usize = 1_000;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub instances: Vec<Value>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub return_probabilities: bool,
}

impl PredictionRequest {
    pub fn new(instances: Vec<Value>) -> Self {
        Self {
            instances,
            use_cache: true,
            return_probabilities: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPredictionRequest {
    pub instances: Vec<Value>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub return_probabilities: bool,
    #[serde(default)]
    pub fail_on_error: bool,
}

impl BatchPredictionRequest {
    pub fn new(instances: Vec<Value>) -> Self {
        Self {
            instances,
            batch_size: None,
            return_probabilities: false,
            fail_on_error: false,
        }
    }
}

/// Outcome for one instance. `error` is set, and `prediction` is null, when
/// that instance failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub prediction: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionResult {
    pub fn success(index: usize, prediction: Value) -> Self {
        Self {
            prediction,
            probabilities: None,
            confidence: None,
            index,
            error: None,
        }
    }

    pub fn failure(index: usize, error: impl Into<String>) -> Self {
        Self {
            prediction: Value::Null,
            probabilities: None,
            confidence: None,
            index,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub deployment_id: String,
    pub deployment_name: String,
    pub model_name: String,
    pub version: String,
    pub framework: String,
    pub model_version_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionMetadata {
    pub request_id: String,
    pub latency_ms: f64,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
    pub prediction_count: usize,
}

impl Default for PredictionMetadata {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            latency_ms: 0.0,
            cached: false,
            timestamp: Utc::now(),
            prediction_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub predictions: Vec<PredictionResult>,
    pub model_info: ModelInfo,
    pub metadata: PredictionMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub request_id: String,
    pub total_instances: usize,
    pub successful_predictions: usize,
    pub failed_predictions: usize,
    pub batch_size: usize,
    pub total_latency_ms: f64,
    pub avg_latency_per_instance: f64,
    pub success_rate: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPredictionResponse {
    pub predictions: Vec<PredictionResult>,
    pub model_info: ModelInfo,
    pub metadata: BatchMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentHealth {
    pub status: HealthStatus,
    pub deployment_id: String,
    pub model_loaded: bool,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaResponse {
    pub deployment_id: String,
    pub schema: Value,
    pub examples: Vec<Value>,
    pub description: Option<String>,
}
