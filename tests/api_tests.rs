// INTEGRATION TESTS: HTTP Surface
//
// Requests go through the full axum router with `tower::ServiceExt::oneshot`.

mod common;

use std::collections::BTreeMap;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use model_serving_core::{
    api::{create_router, AppState},
    security::{RateLimiterConfig, RateWindow},
};

fn router(limits: RateLimiterConfig) -> Router {
    create_router(AppState::new(common::harness(limits).orchestrator))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", "test-key")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn admin(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-api-key", "ops-key")
        .header("x-permissions", "admin,health");
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, body)
}

#[tokio::test]
async fn test_service_health() {
    let app = router(RateLimiterConfig::default());
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["loaded_models"], 0);
}

#[tokio::test]
async fn test_predict_round_trip() {
    let app = router(RateLimiterConfig::default());

    let (status, _, body) = send(
        &app,
        post("/api/v1/inference/fraud-v1", json!({"instances": [{"amount": "abc"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let (status, _, body) = send(
        &app,
        post(
            "/api/v1/inference/fraud-v1",
            json!({"instances": [{"amount": 120.5}], "return_probabilities": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["cached"], false);
    assert_eq!(body["predictions"][0]["prediction"], "fraud");
    assert!(body["predictions"][0]["probabilities"]["fraud"].is_number());
    assert_eq!(body["model_info"]["deployment_id"], "dep-fraud-v1");
}

#[tokio::test]
async fn test_batch_endpoint_reports_partial_failure() {
    let app = router(RateLimiterConfig::default());
    let instances: Vec<Value> = (0..6)
        .map(|i| json!({"x": i, "fail": i == 2}))
        .collect();

    let (status, _, body) = send(
        &app,
        post("/api/v1/inference/scorer/batch", json!({"instances": instances, "batch_size": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["failed_predictions"], 1);
    assert_eq!(body["metadata"]["successful_predictions"], 5);
    assert_eq!(body["metadata"]["batch_size"], 3);
    assert!(body["predictions"][2]["error"].is_string());
}

#[tokio::test]
async fn test_unknown_deployment_is_404() {
    let app = router(RateLimiterConfig::default());
    let (status, _, body) = send(
        &app,
        post("/api/v1/inference/missing", json!({"instances": [{"x": 1}]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "DEPLOYMENT_NOT_FOUND");
    assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn test_rate_limit_sets_retry_after() {
    let app = router(RateLimiterConfig {
        default_limits: BTreeMap::from([(RateWindow::PerMinute, 1)]),
        ..Default::default()
    });
    let body = json!({"instances": [{"x": 1}]});

    let (status, _, _) = send(&app, post("/api/v1/inference/scorer", body.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = send(&app, post("/api/v1/inference/scorer", body)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
}

#[tokio::test]
async fn test_deployment_health_and_schema() {
    let app = router(RateLimiterConfig::default());

    let request = Request::builder()
        .uri("/api/v1/inference/fraud-v1/health")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["model_loaded"], false);

    let request = Request::builder()
        .uri("/api/v1/inference/fraud-v1/schema")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["examples"][0]["amount"], 120.5);
}

#[tokio::test]
async fn test_admin_routes_require_permission() {
    let app = router(RateLimiterConfig::default());
    let request = Request::builder()
        .uri("/api/v1/models/loaded")
        .header("x-permissions", "inference")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_anonymous_caller_cannot_administer_limits() {
    let app = router(RateLimiterConfig {
        default_limits: BTreeMap::from([(RateWindow::PerMinute, 1)]),
        ..Default::default()
    });
    let anonymous = |method: &str, uri: &str, body: Option<Value>| {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    };

    let requests = [
        anonymous(
            "PUT",
            "/api/v1/rate-limits/anonymous/custom",
            Some(json!({"limits": {"requests_per_minute": 0}})),
        ),
        anonymous("DELETE", "/api/v1/rate-limits/anonymous/custom", None),
        anonymous("POST", "/api/v1/rate-limits/anonymous/reset", None),
        anonymous("GET", "/api/v1/rate-limits/anonymous", None),
        anonymous("GET", "/api/v1/rate-limits/anonymous/violations", None),
        anonymous("GET", "/api/v1/models/loaded", None),
        anonymous("DELETE", "/api/v1/models/mv-scorer", None),
        anonymous("POST", "/api/v1/models/mv-scorer/reload", None),
    ];
    for request in requests {
        let uri = request.uri().to_string();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(body["code"], "FORBIDDEN");
    }

    // Request-path classes stay open and the limit still holds.
    let predict = || {
        anonymous(
            "POST",
            "/api/v1/inference/scorer",
            Some(json!({"instances": [{"x": 1}]})),
        )
    };
    let (status, _, _) = send(&app, predict()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, predict()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_malformed_bodies_use_the_error_format() {
    let app = router(RateLimiterConfig::default());
    let raw = |body: &'static str| {
        Request::builder()
            .method("POST")
            .uri("/api/v1/inference/fraud-v1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    };

    let (status, _, body) = send(&app, raw("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_JSON");
    assert_eq!(body["status"], 400);

    let (status, _, body) = send(&app, raw(r#"{"rows": []}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST_BODY");
    assert!(body["error"].as_str().unwrap().contains("instances"));

    let (status, _, body) = send(
        &app,
        admin("PUT", "/api/v1/rate-limits/key_acme/custom", Some(json!({"limits": 5}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST_BODY");
}

#[tokio::test]
async fn test_admin_rate_limit_lifecycle() {
    let app = router(RateLimiterConfig::default());

    let (status, _, _) = send(
        &app,
        admin(
            "PUT",
            "/api/v1/rate-limits/key_acme/custom",
            Some(json!({"limits": {"requests_per_minute": 7}, "tier": "pro"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&app, admin("GET", "/api/v1/rate-limits/key_acme", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "pro");
    // Tier limits sit above client overrides.
    assert_eq!(body["windows"]["requests_per_minute"]["limit"], 300);

    let (status, _, body) = send(
        &app,
        admin("DELETE", "/api/v1/rate-limits/key_acme/custom", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], true);

    let (status, _, body) = send(&app, admin("POST", "/api/v1/rate-limits/key_acme/reset", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["client_id"], "key_acme");

    let (status, _, body) = send(
        &app,
        admin("GET", "/api/v1/rate-limits/key_acme/violations?hours=1", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_violations"], 0);
    assert_eq!(body["period_hours"], 1);
}

#[tokio::test]
async fn test_admin_model_management() {
    let app = router(RateLimiterConfig::default());
    send(&app, post("/api/v1/inference/scorer", json!({"instances": [{"x": 1}]}))).await;

    let (status, _, body) = send(&app, admin("GET", "/api/v1/models/loaded", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["models"][0]["model_version_id"], "mv-scorer");

    let (status, _, body) = send(&app, admin("POST", "/api/v1/models/mv-scorer/reload", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dropped_cached_responses"], 1);

    let (status, _, _) = send(&app, admin("DELETE", "/api/v1/models/mv-scorer", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&app, admin("DELETE", "/api/v1/models/mv-scorer", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "MODEL_NOT_FOUND");
}

#[tokio::test]
async fn test_unload_keeps_cached_responses() {
    let app = router(RateLimiterConfig::default());
    let request = || post("/api/v1/inference/scorer", json!({"instances": [{"x": 2}]}));

    let (_, _, body) = send(&app, request()).await;
    assert_eq!(body["metadata"]["cached"], false);

    let (status, _, _) = send(&app, admin("DELETE", "/api/v1/models/mv-scorer", None)).await;
    assert_eq!(status, StatusCode::OK);

    // Same artifact, so the cached answer is still served without a reload.
    let (status, _, body) = send(&app, request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadata"]["cached"], true);

    let (_, _, body) = send(&app, admin("GET", "/api/v1/models/loaded", None)).await;
    assert!(body["models"].as_array().unwrap().is_empty());
}
