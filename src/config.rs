use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, str::FromStr};

use crate::{
    inference::OrchestratorConfig,
    models::ModelCacheConfig,
    security::{BatchLimits, RateLimiterConfig, RateWindow},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub models: ModelConfig,
    pub rate_limits: RateLimitConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub catalog_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub max_models_in_memory: usize,
    pub ttl_hours: u64,
    pub reap_interval_secs: u64,
    pub load_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: i64,
    pub requests_per_hour: i64,
    pub requests_per_day: i64,
    pub batch_requests_per_minute: i64,
    pub batch_instances_per_minute: i64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub default_batch_size: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("PORT", 8080),
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                catalog_path: env::var("CATALOG_PATH")
                    .unwrap_or_else(|_| "./demos/catalog.json".to_string()),
            },
            models: ModelConfig {
                max_models_in_memory: env_or("MAX_MODELS_IN_MEMORY", 10),
                ttl_hours: env_or("MODEL_TTL_HOURS", 24),
                reap_interval_secs: env_or("MODEL_REAP_INTERVAL_SECS", 3600),
                // Unset or 0 means waiters block until the load finishes.
                load_timeout_ms: Some(env_or("MODEL_LOAD_TIMEOUT_MS", 0u64)).filter(|ms| *ms > 0),
            },
            rate_limits: RateLimitConfig {
                requests_per_minute: env_or("DEFAULT_REQUESTS_PER_MINUTE", 60),
                requests_per_hour: env_or("DEFAULT_REQUESTS_PER_HOUR", 1_000),
                requests_per_day: env_or("DEFAULT_REQUESTS_PER_DAY", 10_000),
                batch_requests_per_minute: env_or("DEFAULT_BATCH_REQUESTS_PER_MINUTE", 10),
                batch_instances_per_minute: env_or("DEFAULT_BATCH_INSTANCES_PER_MINUTE", 1_000),
                cleanup_interval_secs: env_or("RATE_LIMIT_CLEANUP_SECS", 300),
            },
            inference: InferenceConfig {
                default_batch_size: env_or("DEFAULT_BATCH_SIZE", 100),
                cache_ttl_secs: env_or("INFERENCE_CACHE_TTL", 300),
                cache_capacity: env_or("INFERENCE_CACHE_CAPACITY", 10_000),
            },
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.models.max_models_in_memory == 0 {
            anyhow::bail!("MAX_MODELS_IN_MEMORY must be at least 1");
        }
        if self.models.ttl_hours == 0 {
            anyhow::bail!("MODEL_TTL_HOURS must be at least 1");
        }
        if self.models.reap_interval_secs == 0 {
            anyhow::bail!("MODEL_REAP_INTERVAL_SECS must be at least 1");
        }
        // Window limits need no check here: a value <= 0 disables the window.
        let limits = &self.rate_limits;
        if limits.cleanup_interval_secs == 0 {
            anyhow::bail!("RATE_LIMIT_CLEANUP_SECS must be at least 1");
        }
        if !(1..=crate::inference::types::MAX_BATCH_SIZE).contains(&self.inference.default_batch_size) {
            anyhow::bail!(
                "DEFAULT_BATCH_SIZE must be between 1 and {}",
                crate::inference::types::MAX_BATCH_SIZE
            );
        }
        Ok(())
    }

    pub fn model_cache(&self) -> ModelCacheConfig {
        ModelCacheConfig {
            max_models: self.models.max_models_in_memory,
            ttl_seconds: self.models.ttl_hours * 3600,
            reap_interval_seconds: self.models.reap_interval_secs,
            load_wait_timeout_ms: self.models.load_timeout_ms,
        }
    }

    pub fn rate_limiter(&self) -> RateLimiterConfig {
        let limits = &self.rate_limits;
        RateLimiterConfig {
            default_limits: BTreeMap::from([
                (RateWindow::PerMinute, limits.requests_per_minute),
                (RateWindow::PerHour, limits.requests_per_hour),
                (RateWindow::PerDay, limits.requests_per_day),
            ]),
            batch_limits: BatchLimits {
                batch_requests_per_minute: limits.batch_requests_per_minute,
                batch_instances_per_minute: limits.batch_instances_per_minute,
            },
            cleanup_interval_seconds: limits.cleanup_interval_secs,
            ..RateLimiterConfig::default()
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_batch_size: self.inference.default_batch_size,
        }
    }

    /// `None` when caching is switched off with a zero TTL or capacity.
    pub fn response_cache(&self) -> Option<(usize, std::time::Duration)> {
        let inference = &self.inference;
        (inference.cache_ttl_secs > 0 && inference.cache_capacity > 0).then(|| {
            (
                inference.cache_capacity,
                std::time::Duration::from_secs(inference.cache_ttl_secs),
            )
        })
    }
}
