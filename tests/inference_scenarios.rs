// INTEGRATION TESTS: End-to-End Inference Scenarios
//
// Drives the orchestrator the way the HTTP layer does: caller context,
// deployment name and request body in, typed response or `Error` out.

mod common;

use std::{collections::BTreeMap, sync::atomic::Ordering, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};

use model_serving_core::{
    inference::{BatchPredictionRequest, DeploymentResolver, HealthStatus, PredictionRequest},
    security::{
        CallerContext, LimiterBackendError, Permission, RateLimitStore, RateLimitViolation,
        RateLimiter, RateLimiterConfig, RateWindow, WindowUsage,
    },
    Error,
};

use common::{harness, harness_with_limiter};

fn caller() -> CallerContext {
    CallerContext::identified("key_tester")
}

#[tokio::test]
async fn test_fraud_scenario_validates_then_caches() {
    let h = harness(RateLimiterConfig::default());
    let orchestrator = &h.orchestrator;

    let err = orchestrator
        .predict(&caller(), "fraud-v1", PredictionRequest::new(vec![json!({"amount": "abc"})]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.is_caller_error());

    let first = orchestrator
        .predict(&caller(), "fraud-v1", PredictionRequest::new(vec![json!({"amount": 120.5})]))
        .await
        .unwrap();
    assert!(!first.metadata.cached);
    assert_eq!(first.metadata.prediction_count, 1);
    // 0.02 * 120.5 - 1.5 = 0.91, sigmoid above 0.5.
    assert_eq!(first.predictions[0].prediction, json!("fraud"));
    assert!(first.predictions[0].probabilities.is_none());
    assert_eq!(first.model_info.deployment_name, "fraud-v1");

    let second = orchestrator
        .predict(&caller(), "fraud-v1", PredictionRequest::new(vec![json!({"amount": 120.5})]))
        .await
        .unwrap();
    assert!(second.metadata.cached);
    assert_eq!(second.predictions[0].prediction, first.predictions[0].prediction);
    assert_ne!(second.metadata.request_id, first.metadata.request_id);
}

#[tokio::test]
async fn test_cached_response_can_include_probabilities() {
    let h = harness(RateLimiterConfig::default());
    let instances = vec![json!({"amount": 10.0})];

    h.orchestrator
        .predict(&caller(), "fraud-v1", PredictionRequest::new(instances.clone()))
        .await
        .unwrap();

    let mut request = PredictionRequest::new(instances);
    request.return_probabilities = true;
    let cached = h.orchestrator.predict(&caller(), "fraud-v1", request).await.unwrap();

    assert!(cached.metadata.cached);
    let probabilities = cached.predictions[0].probabilities.as_ref().unwrap();
    assert_eq!(probabilities.len(), 2);
    assert!((probabilities["legit"] + probabilities["fraud"] - 1.0).abs() < 1e-9);
    assert_eq!(cached.predictions[0].confidence, Some(probabilities["legit"]));
}

#[tokio::test]
async fn test_use_cache_false_recomputes() {
    let h = harness(RateLimiterConfig::default());
    let mut request = PredictionRequest::new(vec![json!({"amount": 50})]);
    request.use_cache = false;

    for _ in 0..2 {
        let response = h
            .orchestrator
            .predict(&caller(), "fraud-v1", request.clone())
            .await
            .unwrap();
        assert!(!response.metadata.cached);
    }
}

#[tokio::test]
async fn test_batch_partial_failure_is_reported_per_instance() {
    let h = harness(RateLimiterConfig::default());
    let instances: Vec<Value> = (0..10)
        .map(|i| {
            if i == 3 {
                json!({"x": i, "fail": true})
            } else {
                json!({"x": i})
            }
        })
        .collect();

    let response = h
        .orchestrator
        .predict_batch(&caller(), "scorer", BatchPredictionRequest::new(instances))
        .await
        .unwrap();

    let meta = &response.metadata;
    assert_eq!(meta.total_instances, 10);
    assert_eq!(meta.successful_predictions, 9);
    assert_eq!(meta.failed_predictions, 1);
    assert_eq!(meta.successful_predictions + meta.failed_predictions, meta.total_instances);
    assert_eq!(meta.batch_size, 4);
    assert!((meta.success_rate - 0.9).abs() < 1e-9);

    assert_eq!(response.predictions.len(), 10);
    assert!(response.predictions[3].error.is_some());
    assert_eq!(response.predictions[3].prediction, Value::Null);
    for (i, prediction) in response.predictions.iter().enumerate() {
        assert_eq!(prediction.index, i);
        if i != 3 {
            assert_eq!(prediction.prediction, json!(i as f64 * 2.0));
        }
    }
}

#[tokio::test]
async fn test_batch_fail_on_error_aborts() {
    let h = harness(RateLimiterConfig::default());
    let mut request = BatchPredictionRequest::new(vec![json!({"x": 1}), json!({"x": 2, "fail": true})]);
    request.fail_on_error = true;

    let err = h
        .orchestrator
        .predict_batch(&caller(), "scorer", request)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Inference(_)));
}

#[tokio::test]
async fn test_batch_validation_failures_stay_per_instance() {
    let h = harness(RateLimiterConfig::default());
    let request = BatchPredictionRequest::new(vec![
        json!({"amount": 10}),
        json!({"amount": -5}),
        json!({"merchant": "x"}),
        json!({"amount": "20"}),
    ]);

    let response = h
        .orchestrator
        .predict_batch(&caller(), "fraud-v1", request)
        .await
        .unwrap();
    let errors: Vec<bool> = response.predictions.iter().map(|p| p.is_error()).collect();
    assert_eq!(errors, vec![false, true, true, false]);
}

#[tokio::test]
async fn test_request_bounds() {
    let h = harness(RateLimiterConfig::default());

    let empty = h
        .orchestrator
        .predict(&caller(), "fraud-v1", PredictionRequest::new(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(empty, Error::Validation(_)));

    let too_many = vec![json!({"amount": 1}); 1_001];
    let err = h
        .orchestrator
        .predict(&caller(), "fraud-v1", PredictionRequest::new(too_many))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let mut oversized_chunk = BatchPredictionRequest::new(vec![json!({"x": 1})]);
    oversized_chunk.batch_size = Some(1_001);
    let err = h
        .orchestrator
        .predict_batch(&caller(), "scorer", oversized_chunk)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_unknown_and_inactive_deployments_are_not_found() {
    let h = harness(RateLimiterConfig::default());
    let request = PredictionRequest::new(vec![json!({"x": 1})]);

    for name in ["nope", "retired", "dep-retired"] {
        let err = h
            .orchestrator
            .predict(&caller(), name, request.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeploymentNotFound(_)), "{name}: {err}");
    }
    assert_eq!(h.loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rate_limited_requests_are_rejected() {
    let h = harness(RateLimiterConfig {
        default_limits: BTreeMap::from([(RateWindow::PerMinute, 2)]),
        ..Default::default()
    });
    let request = PredictionRequest::new(vec![json!({"x": 1})]);

    for _ in 0..2 {
        h.orchestrator
            .predict(&caller(), "scorer", request.clone())
            .await
            .unwrap();
    }
    let err = h
        .orchestrator
        .predict(&caller(), "scorer", request.clone())
        .await
        .unwrap_err();
    match err {
        Error::RateLimited {
            window,
            limit,
            retry_after_seconds,
        } => {
            assert_eq!(window, "requests_per_minute");
            assert_eq!(limit, 2);
            assert!(retry_after_seconds >= 1);
        }
        other => panic!("expected rate limit, got {other}"),
    }

    // Another client has its own budget.
    h.orchestrator
        .predict(&CallerContext::identified("key_other"), "scorer", request)
        .await
        .unwrap();
}

struct DownStore;

fn down<T>() -> Result<T, LimiterBackendError> {
    Err(LimiterBackendError("connection reset".into()))
}

#[async_trait]
impl RateLimitStore for DownStore {
    async fn window_usage(&self, _: &str, _: Duration) -> Result<WindowUsage, LimiterBackendError> {
        down()
    }
    async fn record_event(&self, _: &str, _: Duration, _: u64) -> Result<(), LimiterBackendError> {
        down()
    }
    async fn remove_counters(&self, _: &str) -> Result<usize, LimiterBackendError> {
        down()
    }
    async fn get_value(&self, _: &str) -> Result<Option<Value>, LimiterBackendError> {
        down()
    }
    async fn put_value(&self, _: &str, _: Value, _: Option<Duration>) -> Result<(), LimiterBackendError> {
        down()
    }
    async fn delete_value(&self, _: &str) -> Result<bool, LimiterBackendError> {
        down()
    }
    async fn push_violation(&self, _: RateLimitViolation, _: usize) -> Result<(), LimiterBackendError> {
        down()
    }
    async fn violations(&self, _: &str) -> Result<Vec<RateLimitViolation>, LimiterBackendError> {
        down()
    }
    async fn purge_idle(&self, _: Duration) -> Result<usize, LimiterBackendError> {
        down()
    }
}

#[tokio::test]
async fn test_limiter_outage_fails_open() {
    let limiter = RateLimiter::with_store(RateLimiterConfig::default(), Arc::new(DownStore));
    let h = harness_with_limiter(limiter);

    let response = h
        .orchestrator
        .predict(&caller(), "fraud-v1", PredictionRequest::new(vec![json!({"amount": 5})]))
        .await
        .unwrap();
    assert_eq!(response.predictions.len(), 1);

    let batch = h
        .orchestrator
        .predict_batch(&caller(), "scorer", BatchPredictionRequest::new(vec![json!({"x": 1}); 2_000]))
        .await
        .unwrap();
    assert_eq!(batch.metadata.successful_predictions, 2_000);
    assert_eq!(h.orchestrator.limiter().metrics().failed_open_requests, 2);
}

#[tokio::test]
async fn test_permissions_are_enforced() {
    let h = harness(RateLimiterConfig::default());
    let health_only = CallerContext::identified("key_monitor").with_permissions([Permission::Health]);

    let err = h
        .orchestrator
        .predict(&health_only, "scorer", PredictionRequest::new(vec![json!({"x": 1})]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    let err = h
        .orchestrator
        .predict_batch(&health_only, "scorer", BatchPredictionRequest::new(vec![json!({"x": 1})]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    assert!(h.orchestrator.health(&health_only, "scorer").await.is_ok());
}

#[tokio::test]
async fn test_health_never_loads_the_model() {
    let h = harness(RateLimiterConfig::default());

    let health = h.orchestrator.health(&caller(), "scorer").await.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(!health.model_loaded);
    assert_eq!(h.loads.load(Ordering::SeqCst), 0);

    h.orchestrator
        .predict(&caller(), "scorer", PredictionRequest::new(vec![json!({"x": 1})]))
        .await
        .unwrap();

    let health = h.orchestrator.health(&caller(), "scorer").await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.model_loaded);

    // Inactive deployments report, but never as healthy.
    let retired = h.orchestrator.health(&caller(), "retired").await.unwrap();
    assert_eq!(retired.status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_schema_lookup() {
    let h = harness(RateLimiterConfig::default());

    let schema = h.orchestrator.schema(&caller(), "fraud-v1").await.unwrap();
    assert_eq!(schema.deployment_id, "dep-fraud-v1");
    assert_eq!(schema.examples, vec![json!({"amount": 120.5})]);
    assert_eq!(schema.schema["input_schema"]["required"], json!(["amount"]));

    let err = h.orchestrator.schema(&caller(), "scorer").await.unwrap_err();
    assert!(matches!(err, Error::SchemaUnavailable(_)));
}

#[tokio::test]
async fn test_served_requests_are_recorded() {
    let h = harness(RateLimiterConfig::default());
    assert!(h.catalog.resolve("scorer").await.unwrap().unwrap().last_request_at.is_none());

    h.orchestrator
        .predict(&caller(), "scorer", PredictionRequest::new(vec![json!({"x": 1})]))
        .await
        .unwrap();

    let deployment = h.catalog.resolve("scorer").await.unwrap().unwrap();
    assert!(deployment.last_request_at.is_some());
}
