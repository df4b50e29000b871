use model_serving_core::{
    api::{create_router, AppState},
    catalog::Catalog,
    inference::{InferenceOrchestrator, ResponseCache},
    models::{FsArtifactStore, LoaderRegistry, ModelCache},
    security::RateLimiter,
    Config,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::load()?;

    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 Starting Model Serving Core");
    tracing::info!(
        "📊 Model Cache - Max Models: {}, TTL: {}h, Load Timeout: {:?}ms",
        config.models.max_models_in_memory,
        config.models.ttl_hours,
        config.models.load_timeout_ms
    );
    tracing::info!(
        "📊 Rate Limits - {}/min, {}/hour, {}/day, Batch: {} requests / {} instances per min",
        config.rate_limits.requests_per_minute,
        config.rate_limits.requests_per_hour,
        config.rate_limits.requests_per_day,
        config.rate_limits.batch_requests_per_minute,
        config.rate_limits.batch_instances_per_minute
    );

    // CATALOG: deployments and model versions for standalone serving
    let catalog = Arc::new(Catalog::load(&config.server.catalog_path).await?);
    let artifacts = match catalog.artifact_root() {
        Some(root) => FsArtifactStore::with_root(root),
        None => FsArtifactStore::new(),
    };
    let loaders = Arc::new(LoaderRegistry::with_builtin_loaders());
    tracing::info!("🧩 Supported frameworks: {:?}", loaders.frameworks());

    let models = Arc::new(ModelCache::new(
        config.model_cache(),
        catalog.clone(),
        Arc::new(artifacts),
        loaders,
    ));
    models.start();

    let limiter = Arc::new(RateLimiter::with_config(config.rate_limiter()));
    limiter.start().await;

    let responses = config
        .response_cache()
        .map(|(capacity, ttl)| Arc::new(ResponseCache::new(capacity, ttl)));

    let orchestrator = Arc::new(InferenceOrchestrator::new(
        config.orchestrator(),
        catalog.clone(),
        Arc::clone(&models),
        Arc::clone(&limiter),
        responses,
    ));

    let app = create_router(AppState::new(orchestrator));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("🌐 Server starting on http://{}", addr);
    tracing::info!("📡 Available endpoints:");
    tracing::info!("  • GET  /health - Service health");
    tracing::info!("  • POST /api/v1/inference/{{deployment}} - Prediction");
    tracing::info!("  • POST /api/v1/inference/{{deployment}}/batch - Batch prediction");
    tracing::info!("  • GET  /api/v1/inference/{{deployment}}/health - Deployment health");
    tracing::info!("  • GET  /api/v1/inference/{{deployment}}/schema - Input schema");
    tracing::info!("  • /api/v1/rate-limits/{{client}} - Rate limit administration");
    tracing::info!("  • /api/v1/models - Model cache administration");
    for deployment in catalog.deployments() {
        tracing::info!(
            "  ◦ deployment {} ({}) -> {} [{:?}]",
            deployment.name,
            deployment.id,
            deployment.model_version_id,
            deployment.status
        );
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("✅ Server ready and accepting requests");

    // RELIABILITY: Graceful Shutdown Handling
    // In-flight requests complete before the background sweeps stop.
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("🛑 Shutdown signal received, stopping background tasks");
    limiter.stop().await;
    models.stop();

    if let Err(e) = result {
        tracing::error!("❌ Server error: {}", e);
        return Err(e.into());
    }
    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Handle Ctrl+C for interactive shutdown during development
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    // Handle SIGTERM for graceful container shutdown in production
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
