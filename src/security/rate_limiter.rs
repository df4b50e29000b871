// ARCHITECTURE: Rate Limiter - Multi-Window Sliding Log Implementation
//
// DESIGN PHILOSOPHY:
// This module gates inference traffic with exact sliding windows per client:
// 1. MULTI-WINDOW: minute, hour and day windows checked together on every request
// 2. LAYERED POLICY: defaults < deployment overrides < client overrides < tier limits
// 3. CHECK-THEN-CONSUME: all windows are checked before any is incremented
// 4. STRIPED LOCKING: one async lock per hash(client) stripe, never a global lock
// 5. FAIL-OPEN: backend failures admit the request and are logged, never surfaced
//
// REQUEST CLASSES:
// - inference: single prediction calls
// - batch_inference: batch calls, which additionally pass a batch frequency
//   window and a batch volume window weighted by instance count
//
// PRODUCTION REQUIREMENTS MET:
// ✅ Fair usage enforcement with per-client windows
// ✅ Subscription tiers for identified clients
// ✅ Violation history for abuse investigation
// ✅ Limiter outages never cascade into inference outages

use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use chrono::{Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::{
    policy::{
        client_counter_prefix, counter_key, tier_key, BatchLimitOverrides, BatchLimits,
        EndpointClass, LimitOverrides, OverrideKind, OverrideScope, RateLimitPolicy, RateWindow,
        Tier, ANONYMOUS_CLIENT,
    },
    store::{
        LimiterBackendError, MemoryRateLimitStore, RateLimitStore, RateLimitViolation,
        StoreResult, WindowUsage,
    },
};

const BATCH_SCOPE: &str = "batch";
const BATCH_REQUESTS_WINDOW: &str = "batch_requests_per_minute";
const BATCH_INSTANCES_WINDOW: &str = "batch_instances_per_minute";
const BATCH_WINDOW: Duration = Duration::from_secs(60);

// CONFIGURATION: RateLimiterConfig - Limits and Housekeeping Parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub default_limits: LimitOverrides,     // Per-window defaults (60 / 1000 / 10000)
    pub batch_limits: BatchLimits,          // Batch frequency and volume per minute (10 / 1000)
    pub tier_limits: HashMap<Tier, LimitOverrides>, // Tier table, falls back to built-ins
    pub lock_stripes: usize,                // Number of per-client lock stripes (default: 64)
    pub cleanup_interval_seconds: u64,      // Idle counter sweep interval (default: 300s)
    pub counter_grace_seconds: u64,         // Idle time past window length before purge (default: 60s)
    pub violation_history: usize,           // Violations kept per client (default: 100)
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_limits: BTreeMap::from([
                (RateWindow::PerMinute, 60),
                (RateWindow::PerHour, 1_000),
                (RateWindow::PerDay, 10_000),
            ]),
            batch_limits: BatchLimits {
                batch_requests_per_minute: 10,
                batch_instances_per_minute: 1_000,
            },
            tier_limits: [Tier::Free, Tier::Basic, Tier::Pro, Tier::Enterprise]
                .into_iter()
                .map(|tier| (tier, tier.default_limits()))
                .collect(),
            lock_stripes: 64,
            cleanup_interval_seconds: 300,
            counter_grace_seconds: 60,
            violation_history: 100,
        }
    }
}

// RESULT: RateLimitResult - Admission Decision
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    Allowed,
    RateLimited {
        retry_after_seconds: u64, // Seconds until the blocking window frees a slot
        window: String,           // Which window was exceeded
        current_usage: u64,       // Count inside the window at decision time
        limit: u64,
    },
    FailedOpen, // Backend failed; admitted without accounting
}

impl RateLimitResult {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, RateLimitResult::RateLimited { .. })
    }
}

// Outcome of a check that reached the backend.
#[derive(Debug)]
enum Decision {
    Admit,
    Reject(Rejection),
}

#[derive(Debug)]
struct Rejection {
    window: String,
    limit: u64,
    current_usage: u64,
    retry_after_seconds: u64,
    violation_type: &'static str,
}

// One counter the request will increment if admitted.
struct PendingIncrement {
    key: String,
    window: Duration,
    weight: u64,
}

/// Introspection for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_estimate: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationSummary {
    pub client_id: String,
    pub period_hours: u64,
    pub total_violations: usize,
    pub by_window: BTreeMap<String, usize>,
    pub by_endpoint: BTreeMap<String, usize>,
    pub recent_violations: Vec<RateLimitViolation>,
}

// METRICS: RateLimiterMetrics - Operational Intelligence
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rate_limited_requests: u64,
    pub failed_open_requests: u64,
    pub purged_counters: u64,
}

// CORE SYSTEM: RateLimiter - Sliding Window Admission Engine
pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn RateLimitStore>,
    stripes: Vec<AsyncMutex<()>>,
    metrics: Arc<parking_lot::Mutex<RateLimiterMetrics>>,
    cleanup_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimiter {
    // CONSTRUCTOR: In-memory backend with default limits
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    pub fn with_config(config: RateLimiterConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryRateLimitStore::new()))
    }

    pub fn with_store(config: RateLimiterConfig, store: Arc<dyn RateLimitStore>) -> Self {
        let stripes = (0..config.lock_stripes.max(1))
            .map(|_| AsyncMutex::new(()))
            .collect();
        Self {
            config,
            store,
            stripes,
            metrics: Arc::new(parking_lot::Mutex::new(RateLimiterMetrics::default())),
            cleanup_handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    // LIFECYCLE: Start the idle counter sweep
    pub async fn start(&self) {
        let mut handle_slot = self.cleanup_handle.lock();
        if handle_slot.is_some() {
            return;
        }

        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds.max(1));
        let grace = Duration::from_secs(self.config.counter_grace_seconds);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.purge_idle(grace).await {
                    Ok(0) => {}
                    Ok(purged) => {
                        metrics.lock().purged_counters += purged as u64;
                        debug!(purged_counters = purged, "Cleaned up idle rate limit counters");
                    }
                    Err(e) => warn!(error = %e, "Rate limit counter cleanup failed"),
                }
            }
        });
        *handle_slot = Some(handle);

        info!(
            requests_per_minute = self.config.default_limits.get(&RateWindow::PerMinute).copied().unwrap_or(0),
            stripes = self.stripes.len(),
            "🚦 Rate Limiter started"
        );
    }

    // LIFECYCLE: Stop the sweep
    pub async fn stop(&self) {
        if let Some(handle) = self.cleanup_handle.lock().take() {
            handle.abort();
            info!("Rate Limiter stopped");
        }
    }

    /// Admission check for a single inference request. Consumes one slot in
    /// every limited window when admitted.
    pub async fn check_and_consume(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
        endpoint: EndpointClass,
    ) -> bool {
        self.check(client_id, deployment_id, endpoint).await.is_admitted()
    }

    pub async fn check_and_consume_batch(
        &self,
        client_id: &str,
        instance_count: usize,
        deployment_id: Option<&str>,
    ) -> bool {
        self.check_batch(client_id, instance_count, deployment_id)
            .await
            .is_admitted()
    }

    /// Same as `check_and_consume`, but reports which window rejected and when
    /// to retry.
    pub async fn check(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
        endpoint: EndpointClass,
    ) -> RateLimitResult {
        let outcome = async {
            let policy = self.resolve_policy(client_id, deployment_id).await?;
            self.evaluate(client_id, endpoint, &policy, None).await
        }
        .await;
        self.settle(client_id, deployment_id, endpoint, outcome).await
    }

    pub async fn check_batch(
        &self,
        client_id: &str,
        instance_count: usize,
        deployment_id: Option<&str>,
    ) -> RateLimitResult {
        let endpoint = EndpointClass::BatchInference;
        let outcome = async {
            let batch = self.resolve_batch_limits(client_id, deployment_id).await?;
            let policy = self.resolve_policy(client_id, deployment_id).await?;
            self.evaluate(client_id, endpoint, &policy, Some((batch, instance_count as u64)))
                .await
        }
        .await;
        self.settle(client_id, deployment_id, endpoint, outcome).await
    }

    fn stripe(&self, client_id: &str) -> &AsyncMutex<()> {
        let mut hasher = DefaultHasher::new();
        client_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    // Turn a backend outcome into the caller-facing result. The Err arm is the
    // fail-open branch.
    async fn settle(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
        endpoint: EndpointClass,
        outcome: StoreResult<Decision>,
    ) -> RateLimitResult {
        self.metrics.lock().total_requests += 1;

        match outcome {
            Ok(Decision::Admit) => {
                self.metrics.lock().allowed_requests += 1;
                RateLimitResult::Allowed
            }
            Ok(Decision::Reject(rejection)) => {
                self.metrics.lock().rate_limited_requests += 1;
                warn!(
                    client_id = %client_id,
                    deployment_id = ?deployment_id,
                    endpoint = endpoint.as_str(),
                    window = %rejection.window,
                    limit = rejection.limit,
                    current_usage = rejection.current_usage,
                    "⛔ Rate limit exceeded"
                );
                self.record_violation(client_id, deployment_id, endpoint, &rejection)
                    .await;
                RateLimitResult::RateLimited {
                    retry_after_seconds: rejection.retry_after_seconds,
                    window: rejection.window,
                    current_usage: rejection.current_usage,
                    limit: rejection.limit,
                }
            }
            Err(e) => {
                self.metrics.lock().failed_open_requests += 1;
                error!(
                    client_id = %client_id,
                    endpoint = endpoint.as_str(),
                    error = %e,
                    "Rate limiter backend failed, admitting request"
                );
                RateLimitResult::FailedOpen
            }
        }
    }

    // Two phases: check every window, then increment every window. Limits are
    // resolved by the caller; only counter reads and writes run under the
    // client's stripe lock, so concurrent requests cannot interleave.
    async fn evaluate(
        &self,
        client_id: &str,
        endpoint: EndpointClass,
        policy: &RateLimitPolicy,
        batch: Option<(BatchLimits, u64)>,
    ) -> StoreResult<Decision> {
        let _guard = self.stripe(client_id).lock().await;
        let mut pending = Vec::new();

        if let Some((limits, instances)) = batch {
        for (window, limit) in policy.active_windows() {
            let key = counter_key(client_id, endpoint.as_str(), window.name());
            let usage = self.store.window_usage(&key, window.duration()).await?;
            if usage.total >= limit {
                return Ok(Decision::Reject(Rejection {
                    window: window.name().to_string(),
                    limit,
                    current_usage: usage.total,
                    retry_after_seconds: retry_after(window.duration(), &usage),
                    violation_type: "rate_limit_exceeded",
                }));
            }
            pending.push(PendingIncrement {
                key,
                window: window.duration(),
                weight: 1,
            });
        }

        for increment in pending {
            self.store
                .record_event(&increment.key, increment.window, increment.weight)
                .await?;
        }
        Ok(Decision::Admit)
    }

    /// Effective per-window limits for a client, re-read on every call.
    pub async fn resolve_policy(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
    ) -> StoreResult<RateLimitPolicy> {
        let mut policy = RateLimitPolicy::new(&self.config.default_limits);

        if let Some(deployment_id) = deployment_id {
            let scope = OverrideScope::deployment(deployment_id);
            if let Some(overrides) = self.load_overrides::<LimitOverrides>(&scope, OverrideKind::Regular).await? {
                policy.apply(&overrides);
            }
        }

        let mut client_scopes = vec![OverrideScope::client(client_id, None)];
        if deployment_id.is_some() {
            client_scopes.push(OverrideScope::client(client_id, deployment_id));
        }
        for scope in &client_scopes {
            if let Some(overrides) = self.load_overrides::<LimitOverrides>(scope, OverrideKind::Regular).await? {
                policy.apply(&overrides);
            }
        }

        if client_id != ANONYMOUS_CLIENT {
            if let Some(tier) = self.client_tier(client_id).await? {
                let limits = self
                    .config
                    .tier_limits
                    .get(&tier)
                    .cloned()
                    .unwrap_or_else(|| tier.default_limits());
                policy.apply(&limits);
            }
        }

        Ok(policy)
    }

    async fn resolve_batch_limits(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
    ) -> StoreResult<BatchLimits> {
        let mut limits = self.config.batch_limits;
        let mut scopes = vec![OverrideScope::client(client_id, None)];
        if deployment_id.is_some() {
            scopes.push(OverrideScope::client(client_id, deployment_id));
        }
        for scope in &scopes {
            if let Some(overrides) = self.load_overrides::<BatchLimitOverrides>(scope, OverrideKind::Batch).await? {
                limits.apply(&overrides);
            }
        }
        Ok(limits)
    }

    async fn load_overrides<T: DeserializeOwned>(
        &self,
        scope: &OverrideScope,
        kind: OverrideKind,
    ) -> StoreResult<Option<T>> {
        let key = scope.storage_key(kind);
        match self.store.get_value(&key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| LimiterBackendError(format!("corrupt override at {key}: {e}"))),
            None => Ok(None),
        }
    }

    async fn record_violation(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
        endpoint: EndpointClass,
        rejection: &Rejection,
    ) {
        let violation = RateLimitViolation {
            client_id: client_id.to_string(),
            deployment_id: deployment_id.map(str::to_string),
            endpoint: endpoint.as_str().to_string(),
            window: rejection.window.clone(),
            limit: rejection.limit,
            timestamp: Utc::now(),
            violation_type: rejection.violation_type.to_string(),
        };
        if let Err(e) = self
            .store
            .push_violation(violation, self.config.violation_history)
            .await
        {
            warn!(client_id = %client_id, error = %e, "Failed to record rate limit violation");
        }
    }

    // API: Per-window usage for the single-inference class. Empty on backend failure.
    pub async fn status(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
    ) -> BTreeMap<RateWindow, WindowStatus> {
        match self.try_status(client_id, deployment_id).await {
            Ok(status) => status,
            Err(e) => {
                error!(client_id = %client_id, error = %e, "Rate limit status unavailable");
                BTreeMap::new()
            }
        }
    }

    async fn try_status(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
    ) -> StoreResult<BTreeMap<RateWindow, WindowStatus>> {
        let policy = self.resolve_policy(client_id, deployment_id).await?;
        let now = Utc::now();
        let mut status = BTreeMap::new();

        for (window, limit) in policy.active_windows() {
            let key = counter_key(client_id, EndpointClass::Inference.as_str(), window.name());
            let usage = self.store.window_usage(&key, window.duration()).await?;
            let until_reset = usage
                .oldest_age
                .map(|age| window.duration().saturating_sub(age))
                .unwrap_or_default();
            status.insert(
                window,
                WindowStatus {
                    limit,
                    used: usage.total,
                    remaining: limit.saturating_sub(usage.total),
                    reset_estimate: now
                        + ChronoDuration::from_std(until_reset).unwrap_or_else(|_| ChronoDuration::zero()),
                },
            );
        }
        Ok(status)
    }

    // ADMIN: Client overrides, optionally narrowed to one deployment
    pub async fn set_custom_limits(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
        limits: LimitOverrides,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let scope = OverrideScope::client(client_id, deployment_id);
        self.store_overrides(&scope, OverrideKind::Regular, &limits, ttl)
            .await?;
        info!(client_id = %client_id, deployment_id = ?deployment_id, limits = ?limits, "Custom rate limits set");
        Ok(())
    }

    pub async fn remove_custom_limits(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
    ) -> StoreResult<bool> {
        let scope = OverrideScope::client(client_id, deployment_id);
        let removed = self
            .store
            .delete_value(&scope.storage_key(OverrideKind::Regular))
            .await?;
        if removed {
            info!(client_id = %client_id, deployment_id = ?deployment_id, "Custom rate limits removed");
        }
        Ok(removed)
    }

    pub async fn set_deployment_limits(
        &self,
        deployment_id: &str,
        limits: LimitOverrides,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let scope = OverrideScope::deployment(deployment_id);
        self.store_overrides(&scope, OverrideKind::Regular, &limits, ttl)
            .await?;
        info!(deployment_id = %deployment_id, limits = ?limits, "Deployment rate limits set");
        Ok(())
    }

    pub async fn remove_deployment_limits(&self, deployment_id: &str) -> StoreResult<bool> {
        let scope = OverrideScope::deployment(deployment_id);
        self.store
            .delete_value(&scope.storage_key(OverrideKind::Regular))
            .await
    }

    pub async fn set_custom_batch_limits(
        &self,
        client_id: &str,
        deployment_id: Option<&str>,
        limits: BatchLimitOverrides,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let scope = OverrideScope::client(client_id, deployment_id);
        self.store_overrides(&scope, OverrideKind::Batch, &limits, ttl)
            .await
    }

    async fn store_overrides<T: Serialize>(
        &self,
        scope: &OverrideScope,
        kind: OverrideKind,
        overrides: &T,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let value = serde_json::to_value(overrides)
            .map_err(|e| LimiterBackendError(format!("unserializable override: {e}")))?;
        self.store
            .put_value(&scope.storage_key(kind), value, ttl)
            .await
    }

    pub async fn set_client_tier(&self, client_id: &str, tier: Option<Tier>) -> StoreResult<()> {
        let key = tier_key(client_id);
        match tier {
            Some(tier) => {
                self.store
                    .put_value(&key, serde_json::json!(tier.as_str()), None)
                    .await?;
                info!(client_id = %client_id, tier = tier.as_str(), "Client tier assigned");
            }
            None => {
                self.store.delete_value(&key).await?;
            }
        }
        Ok(())
    }

    pub async fn client_tier(&self, client_id: &str) -> StoreResult<Option<Tier>> {
        match self.store.get_value(&tier_key(client_id)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| LimiterBackendError(format!("corrupt tier for {client_id}: {e}"))),
            None => Ok(None),
        }
    }

    // ADMIN: Drop every counter the client owns
    pub async fn reset_client_limits(&self, client_id: &str) -> StoreResult<usize> {
        let _guard = self.stripe(client_id).lock().await;
        let removed = self
            .store
            .remove_counters(&client_counter_prefix(client_id))
            .await?;
        info!(client_id = %client_id, removed_counters = removed, "Rate limits reset for client");
        Ok(removed)
    }

    pub async fn violations_summary(
        &self,
        client_id: &str,
        hours: u64,
    ) -> StoreResult<ViolationSummary> {
        let cutoff = Utc::now() - ChronoDuration::hours(hours as i64);
        let violations: Vec<_> = self
            .store
            .violations(client_id)
            .await?
            .into_iter()
            .filter(|violation| violation.timestamp >= cutoff)
            .collect();

        let mut by_window = BTreeMap::new();
        let mut by_endpoint = BTreeMap::new();
        for violation in &violations {
            *by_window.entry(violation.window.clone()).or_insert(0) += 1;
            *by_endpoint.entry(violation.endpoint.clone()).or_insert(0) += 1;
        }

        Ok(ViolationSummary {
            client_id: client_id.to_string(),
            period_hours: hours,
            total_violations: violations.len(),
            by_window,
            by_endpoint,
            recent_violations: violations.into_iter().take(10).collect(),
        })
    }

    // API: Get current rate limiter metrics
    pub fn metrics(&self) -> RateLimiterMetrics {
        self.metrics.lock().clone()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.get_mut().take() {
            handle.abort();
        }
    }
}

// Seconds until the oldest event leaves the window, at least one.
fn retry_after(window: Duration, usage: &WindowUsage) -> u64 {
    let wait = usage
        .oldest_age
        .map(|age| window.saturating_sub(age))
        .unwrap_or(window);
    (wait.as_secs_f64().ceil() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn limiter_with_minute_limit(limit: i64) -> RateLimiter {
        RateLimiter::with_config(RateLimiterConfig {
            default_limits: BTreeMap::from([(RateWindow::PerMinute, limit)]),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_rate_limiter_allows_requests_within_limit() {
        let limiter = limiter_with_minute_limit(5);
        for _ in 0..5 {
            let result = limiter.check("client1", None, EndpointClass::Inference).await;
            assert_eq!(result, RateLimitResult::Allowed);
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_blocks_requests_over_limit() {
        let limiter = limiter_with_minute_limit(3);
        for _ in 0..3 {
            assert!(limiter.check_and_consume("client1", None, EndpointClass::Inference).await);
        }

        let result = limiter.check("client1", None, EndpointClass::Inference).await;
        match result {
            RateLimitResult::RateLimited { window, limit, current_usage, retry_after_seconds } => {
                assert_eq!(window, "requests_per_minute");
                assert_eq!(limit, 3);
                assert_eq!(current_usage, 3);
                assert!(retry_after_seconds >= 1 && retry_after_seconds <= 60);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(limiter.metrics().rate_limited_requests, 1);
    }

    #[tokio::test]
    async fn test_rate_limiter_per_client_isolation() {
        let limiter = limiter_with_minute_limit(2);
        for _ in 0..2 {
            assert!(limiter.check_and_consume("client1", None, EndpointClass::Inference).await);
        }
        assert!(!limiter.check_and_consume("client1", None, EndpointClass::Inference).await);
        assert!(limiter.check_and_consume("client2", None, EndpointClass::Inference).await);
    }

    #[tokio::test]
    async fn test_rejection_consumes_nothing() {
        let limiter = RateLimiter::with_config(RateLimiterConfig {
            default_limits: BTreeMap::from([(RateWindow::PerMinute, 2), (RateWindow::PerHour, 100)]),
            ..Default::default()
        });
        for _ in 0..4 {
            limiter.check_and_consume("c", None, EndpointClass::Inference).await;
        }
        let status = limiter.status("c", None).await;
        assert_eq!(status[&RateWindow::PerMinute].used, 2);
        assert_eq!(status[&RateWindow::PerHour].used, 2);
    }

    #[tokio::test]
    async fn test_non_positive_limit_is_unlimited() {
        let limiter = limiter_with_minute_limit(0);
        for _ in 0..100 {
            assert!(limiter.check_and_consume("c", None, EndpointClass::Inference).await);
        }
        assert!(limiter.status("c", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_tier_applies_to_identified_clients_only() {
        let limiter = limiter_with_minute_limit(100);
        limiter.set_client_tier("acme", Some(Tier::Free)).await.unwrap();
        limiter.set_client_tier(ANONYMOUS_CLIENT, Some(Tier::Free)).await.unwrap();

        let acme = limiter.resolve_policy("acme", None).await.unwrap();
        let anonymous = limiter.resolve_policy(ANONYMOUS_CLIENT, None).await.unwrap();
        assert_eq!(acme.limit(RateWindow::PerMinute), 10);
        assert_eq!(anonymous.limit(RateWindow::PerMinute), 100);
    }

    #[tokio::test]
    async fn test_client_deployment_override_beats_deployment_override() {
        let limiter = limiter_with_minute_limit(100);
        limiter
            .set_deployment_limits("dep", BTreeMap::from([(RateWindow::PerMinute, 20)]), None)
            .await
            .unwrap();
        limiter
            .set_custom_limits("c", Some("dep"), BTreeMap::from([(RateWindow::PerMinute, 5)]), None)
            .await
            .unwrap();

        let policy = limiter.resolve_policy("c", Some("dep")).await.unwrap();
        assert_eq!(policy.limit(RateWindow::PerMinute), 5);
        let other = limiter.resolve_policy("other", Some("dep")).await.unwrap();
        assert_eq!(other.limit(RateWindow::PerMinute), 20);

        assert!(limiter.remove_custom_limits("c", Some("dep")).await.unwrap());
        let policy = limiter.resolve_policy("c", Some("dep")).await.unwrap();
        assert_eq!(policy.limit(RateWindow::PerMinute), 20);
    }

    #[tokio::test]
    async fn test_batch_volume_projection_rejects_without_consuming() {
        let limiter = RateLimiter::new();
        assert!(limiter.check_and_consume_batch("c", 900, None).await);

        let result = limiter.check_batch("c", 200, None).await;
        assert!(matches!(
            result,
            RateLimitResult::RateLimited { ref window, .. } if window == BATCH_INSTANCES_WINDOW
        ));

        // 100 more still fits: the rejected 200 were never counted.
        assert!(limiter.check_and_consume_batch("c", 100, None).await);
    }

    #[tokio::test]
    async fn test_reset_and_violation_summary() {
        let limiter = limiter_with_minute_limit(1);
        assert!(limiter.check_and_consume("c", Some("dep"), EndpointClass::Inference).await);
        assert!(!limiter.check_and_consume("c", Some("dep"), EndpointClass::Inference).await);

        let summary = limiter.violations_summary("c", 24).await.unwrap();
        assert_eq!(summary.total_violations, 1);
        assert_eq!(summary.by_window.get("requests_per_minute"), Some(&1));
        assert_eq!(summary.recent_violations[0].deployment_id.as_deref(), Some("dep"));

        assert!(limiter.reset_client_limits("c").await.unwrap() > 0);
        assert!(limiter.check_and_consume("c", Some("dep"), EndpointClass::Inference).await);
    }

    struct UnreachableStore;

    #[async_trait]
    impl RateLimitStore for UnreachableStore {
        async fn window_usage(&self, _: &str, _: Duration) -> StoreResult<WindowUsage> {
            Err(LimiterBackendError("connection refused".into()))
        }
        async fn record_event(&self, _: &str, _: Duration, _: u64) -> StoreResult<()> {
            Err(LimiterBackendError("connection refused".into()))
        }
        async fn remove_counters(&self, _: &str) -> StoreResult<usize> {
            Err(LimiterBackendError("connection refused".into()))
        }
        async fn get_value(&self, _: &str) -> StoreResult<Option<serde_json::Value>> {
            Err(LimiterBackendError("connection refused".into()))
        }
        async fn put_value(&self, _: &str, _: serde_json::Value, _: Option<Duration>) -> StoreResult<()> {
            Err(LimiterBackendError("connection refused".into()))
        }
        async fn delete_value(&self, _: &str) -> StoreResult<bool> {
            Err(LimiterBackendError("connection refused".into()))
        }
        async fn push_violation(&self, _: RateLimitViolation, _: usize) -> StoreResult<()> {
            Err(LimiterBackendError("connection refused".into()))
        }
        async fn violations(&self, _: &str) -> StoreResult<Vec<RateLimitViolation>> {
            Err(LimiterBackendError("connection refused".into()))
        }
        async fn purge_idle(&self, _: Duration) -> StoreResult<usize> {
            Err(LimiterBackendError("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_backend_failure_fails_open() {
        let limiter = RateLimiter::with_store(RateLimiterConfig::default(), Arc::new(UnreachableStore));
        for _ in 0..200 {
            assert!(limiter.check_and_consume("c", None, EndpointClass::Inference).await);
        }
        assert_eq!(limiter.check_batch("c", 5_000, None).await, RateLimitResult::FailedOpen);
        assert!(limiter.status("c", None).await.is_empty());
        assert_eq!(limiter.metrics().failed_open_requests, 201);
    }

    #[tokio::test]
    async fn test_reset_leaves_clients_sharing_a_prefix_alone() {
        let limiter = limiter_with_minute_limit(1);
        assert!(limiter.check_and_consume("acme", None, EndpointClass::Inference).await);
        assert!(limiter.check_and_consume("acme:eu", None, EndpointClass::Inference).await);

        assert_eq!(limiter.reset_client_limits("acme").await.unwrap(), 1);
        assert!(limiter.check_and_consume("acme", None, EndpointClass::Inference).await);
        assert!(!limiter.check_and_consume("acme:eu", None, EndpointClass::Inference).await);
    }

    // Config reads for client "slow" block until released.
    struct SlowConfigStore {
        inner: MemoryRateLimitStore,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl RateLimitStore for SlowConfigStore {
        async fn window_usage(&self, key: &str, window: Duration) -> StoreResult<WindowUsage> {
            self.inner.window_usage(key, window).await
        }
        async fn record_event(&self, key: &str, window: Duration, weight: u64) -> StoreResult<()> {
            self.inner.record_event(key, window, weight).await
        }
        async fn remove_counters(&self, prefix: &str) -> StoreResult<usize> {
            self.inner.remove_counters(prefix).await
        }
        async fn get_value(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
            if key.contains("slow") {
                self.release.notified().await;
            }
            self.inner.get_value(key).await
        }
        async fn put_value(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> StoreResult<()> {
            self.inner.put_value(key, value, ttl).await
        }
        async fn delete_value(&self, key: &str) -> StoreResult<bool> {
            self.inner.delete_value(key).await
        }
        async fn push_violation(&self, violation: RateLimitViolation, keep: usize) -> StoreResult<()> {
            self.inner.push_violation(violation, keep).await
        }
        async fn violations(&self, client_id: &str) -> StoreResult<Vec<RateLimitViolation>> {
            self.inner.violations(client_id).await
        }
        async fn purge_idle(&self, grace: Duration) -> StoreResult<usize> {
            self.inner.purge_idle(grace).await
        }
    }

    #[tokio::test]
    async fn test_policy_lookup_does_not_block_the_stripe() {
        let release = Arc::new(tokio::sync::Notify::new());
        let store = SlowConfigStore {
            inner: MemoryRateLimitStore::new(),
            release: Arc::clone(&release),
        };
        let limiter = Arc::new(RateLimiter::with_store(
            RateLimiterConfig {
                lock_stripes: 1,
                ..Default::default()
            },
            Arc::new(store),
        ));

        let slow = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.check("slow", None, EndpointClass::Inference).await })
        };
        tokio::task::yield_now().await;

        // Same stripe, but the slow client is still resolving its policy.
        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            limiter.check("fast", None, EndpointClass::Inference),
        )
        .await;
        assert_eq!(fast, Ok(RateLimitResult::Allowed));

        // The slow client reads more than one key; keep releasing until it lands.
        let releaser = tokio::spawn(async move {
            loop {
                release.notify_waiters();
                tokio::task::yield_now().await;
            }
        });
        assert_eq!(slow.await.unwrap(), RateLimitResult::Allowed);
        releaser.abort();
    }
}
