// Shared fixtures for the integration suites: in-memory artifacts, a loader
// that counts its invocations, and a fully wired orchestrator.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use model_serving_core::{
    catalog::Catalog,
    inference::{Deployment, InferenceOrchestrator, OrchestratorConfig, ResponseCache},
    models::{
        Artifact, ArtifactStore, BoxedPredictor, FeatureRow, FrameworkLoader, LoaderRegistry,
        ModelCache, ModelCacheConfig, ModelVersionRecord, Predictor, PredictorInfo, RawPrediction,
    },
    security::{RateLimiter, RateLimiterConfig},
};

pub const FRAUD_ARTIFACT: &str = r#"{
    "task": "binary_classification",
    "features": ["amount"],
    "coefficients": [0.02],
    "intercept": -1.5,
    "classes": ["legit", "fraud"]
}"#;

/// Artifacts held in memory, keyed by path.
#[derive(Default)]
pub struct MemoryArtifacts {
    artifacts: HashMap<String, Vec<u8>>,
    pub fetches: AtomicUsize,
}

impl MemoryArtifacts {
    pub fn with(mut self, path: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.artifacts.insert(path.to_string(), bytes.into());
        self
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn fetch(&self, path: &str) -> Result<Artifact> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .artifacts
            .get(path)
            .ok_or_else(|| anyhow!("no artifact at {path}"))?;
        Ok(Artifact::new(path, bytes.clone()))
    }
}

/// Scores `x * 2`, failing any row flagged with `"fail": true`.
#[derive(Debug)]
pub struct DoublingPredictor {
    pub artifact_path: String,
}

impl Predictor for DoublingPredictor {
    fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<RawPrediction>> {
        rows.iter()
            .map(|row| {
                if row.get("fail") == Some(&Value::Bool(true)) {
                    bail!("instance rejected by model");
                }
                let x = row.get("x").and_then(Value::as_f64).unwrap_or(0.0);
                Ok(RawPrediction {
                    value: json!(x * 2.0),
                    probabilities: None,
                })
            })
            .collect()
    }

    fn info(&self) -> PredictorInfo {
        PredictorInfo {
            framework: "counting".to_string(),
            task: "regression".to_string(),
            features: vec!["x".to_string()],
            classes: None,
            parameters: 1,
        }
    }
}

/// Loader that counts calls and takes `delay` of wall time per load.
pub struct CountingLoader {
    pub loads: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl CountingLoader {
    pub fn new(delay: Duration) -> Self {
        Self {
            loads: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }
}

impl FrameworkLoader for CountingLoader {
    fn framework(&self) -> &'static str {
        "counting"
    }

    fn load(&self, artifact: &Artifact) -> Result<BoxedPredictor> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if artifact.bytes == b"corrupt" {
            bail!("artifact is corrupt");
        }
        Ok(Box::new(DoublingPredictor {
            artifact_path: artifact.path.clone(),
        }))
    }
}

pub fn version(id: &str, framework: &str, artifact_path: &str) -> ModelVersionRecord {
    ModelVersionRecord {
        id: id.to_string(),
        framework: framework.to_string(),
        artifact_path: artifact_path.to_string(),
    }
}

/// Active deployment `name` (id `dep-{name}`) serving `model_version_id`.
pub fn deployment(name: &str, model_version_id: &str, schema: Option<Value>) -> Deployment {
    serde_json::from_value(json!({
        "id": format!("dep-{name}"),
        "name": name,
        "status": "active",
        "model_version_id": model_version_id,
        "model_name": name,
        "version": "1.0.0",
        "framework": "linear",
        "model_schema": schema,
    }))
    .expect("valid deployment fixture")
}

pub fn fraud_schema() -> Value {
    json!({
        "input_schema": {
            "required": ["amount"],
            "properties": {"amount": {"type": "number", "minimum": 0}}
        },
        "output_schema": {"classes": ["legit", "fraud"]},
        "examples": [{"amount": 120.5}]
    })
}

/// `n` versions `m0..m{n-1}` served by the counting loader.
pub fn counting_cache(
    n: usize,
    config: ModelCacheConfig,
    delay: Duration,
) -> (Arc<ModelCache>, Arc<AtomicUsize>) {
    let versions: Vec<_> = (0..n)
        .map(|i| version(&format!("m{i}"), "counting", &format!("m{i}.bin")))
        .collect();
    let mut artifacts = MemoryArtifacts::default();
    for i in 0..n {
        artifacts = artifacts.with(&format!("m{i}.bin"), format!("model {i}"));
    }
    let catalog = Arc::new(Catalog::new(versions, vec![]).expect("catalog"));

    let loader = CountingLoader::new(delay);
    let loads = Arc::clone(&loader.loads);
    let registry = LoaderRegistry::new();
    registry.register(Arc::new(loader));

    let cache = ModelCache::new(config, catalog, Arc::new(artifacts), Arc::new(registry));
    (Arc::new(cache), loads)
}

/// Fully wired service with three deployments:
/// - `fraud-v1`: real linear model with a schema
/// - `scorer`: counting loader, no schema
/// - `retired`: inactive
pub struct Harness {
    pub orchestrator: Arc<InferenceOrchestrator>,
    pub catalog: Arc<Catalog>,
    pub loads: Arc<AtomicUsize>,
}

pub fn harness(limits: RateLimiterConfig) -> Harness {
    harness_with_limiter(RateLimiter::with_config(limits))
}

pub fn harness_with_limiter(limiter: RateLimiter) -> Harness {
    let mut retired = deployment("retired", "mv-scorer", None);
    retired.status = model_serving_core::inference::DeploymentStatus::Inactive;

    let catalog = Arc::new(
        Catalog::new(
            vec![
                version("mv-fraud", "linear", "fraud.json"),
                version("mv-scorer", "counting", "scorer.bin"),
            ],
            vec![
                deployment("fraud-v1", "mv-fraud", Some(fraud_schema())),
                deployment("scorer", "mv-scorer", None),
                retired,
            ],
        )
        .expect("catalog"),
    );
    let artifacts = MemoryArtifacts::default()
        .with("fraud.json", FRAUD_ARTIFACT)
        .with("scorer.bin", "scorer");

    let loader = CountingLoader::new(Duration::ZERO);
    let loads = Arc::clone(&loader.loads);
    let registry = LoaderRegistry::with_builtin_loaders();
    registry.register(Arc::new(loader));

    let models = Arc::new(ModelCache::new(
        ModelCacheConfig::default(),
        catalog.clone(),
        Arc::new(artifacts),
        Arc::new(registry),
    ));
    let orchestrator = InferenceOrchestrator::new(
        OrchestratorConfig {
            default_batch_size: 4,
        },
        catalog.clone(),
        models,
        Arc::new(limiter),
        Some(Arc::new(ResponseCache::new(100, Duration::from_secs(300)))),
    );

    Harness {
        orchestrator: Arc::new(orchestrator),
        catalog,
        loads,
    }
}
