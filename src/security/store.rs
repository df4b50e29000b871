// STORAGE: Rate limiter backend contract and the in-process implementation.
//
// The limiter never talks to a concrete store. Anything that can keep ordered
// event logs with expiry and a small key/value area (Redis sorted sets, a
// sidecar, process memory) can sit behind `RateLimitStore`. Every method
// returns a typed `LimiterBackendError`, which the limiter turns into a
// fail-open decision.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Failure of the limiting substrate itself. Never surfaced to callers of the
/// check operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limit backend error: {0}")]
pub struct LimiterBackendError(pub String);

pub type StoreResult<T> = std::result::Result<T, LimiterBackendError>;

/// Aggregate of the events currently inside a trailing window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    /// Sum of event weights (request count, or instance count for volume windows).
    pub total: u64,
    /// Age of the oldest event still inside the window.
    pub oldest_age: Option<Duration>,
}

/// Observability record written when a request is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitViolation {
    pub client_id: String,
    pub deployment_id: Option<String>,
    pub endpoint: String,
    pub window: String,
    pub limit: u64,
    pub timestamp: DateTime<Utc>,
    pub violation_type: String,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Prune events older than `window` and report what remains.
    async fn window_usage(&self, key: &str, window: Duration) -> StoreResult<WindowUsage>;

    /// Append an event of `weight` at the current instant.
    async fn record_event(&self, key: &str, window: Duration, weight: u64) -> StoreResult<()>;

    /// Drop every counter whose key starts with `prefix`. Returns how many went.
    async fn remove_counters(&self, prefix: &str) -> StoreResult<usize>;

    async fn get_value(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

    async fn put_value(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    async fn delete_value(&self, key: &str) -> StoreResult<bool>;

    /// Push a violation, keeping at most `keep` per client (newest first).
    async fn push_violation(&self, violation: RateLimitViolation, keep: usize) -> StoreResult<()>;

    async fn violations(&self, client_id: &str) -> StoreResult<Vec<RateLimitViolation>>;

    /// Delete counters idle for longer than their window plus `grace`.
    async fn purge_idle(&self, grace: Duration) -> StoreResult<usize>;
}

#[derive(Debug)]
struct EventLog {
    window: Duration,
    events: VecDeque<(Instant, u64)>,
    total: u64,
    last_touched: Instant,
}

impl EventLog {
    fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            events: VecDeque::new(),
            total: 0,
            last_touched: now,
        }
    }

    // An event at `t` is inside the window while `now - t < window`.
    fn prune(&mut self, now: Instant) {
        while let Some((at, weight)) = self.events.front().copied() {
            if now.duration_since(at) >= self.window {
                self.events.pop_front();
                self.total -= weight;
            } else {
                break;
            }
        }
    }

    fn usage(&self, now: Instant) -> WindowUsage {
        WindowUsage {
            total: self.total,
            oldest_age: self.events.front().map(|(at, _)| now.duration_since(*at)),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

/// In-process backend. Counters are individually locked so unrelated clients
/// never contend; the outer map lock is only held for lookup and insertion.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    counters: RwLock<HashMap<String, Arc<Mutex<EventLog>>>>,
    values: RwLock<HashMap<String, StoredValue>>,
    violations: RwLock<HashMap<String, VecDeque<RateLimitViolation>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, key: &str, window: Duration, now: Instant) -> Arc<Mutex<EventLog>> {
        if let Some(log) = self.counters.read().get(key) {
            return Arc::clone(log);
        }
        let mut counters = self.counters.write();
        Arc::clone(
            counters
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(EventLog::new(window, now)))),
        )
    }

    pub fn counter_count(&self) -> usize {
        self.counters.read().len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn window_usage(&self, key: &str, window: Duration) -> StoreResult<WindowUsage> {
        let now = Instant::now();
        let Some(log) = self.counters.read().get(key).cloned() else {
            return Ok(WindowUsage::default());
        };
        let mut log = log.lock();
        log.window = window;
        log.prune(now);
        Ok(log.usage(now))
    }

    async fn record_event(&self, key: &str, window: Duration, weight: u64) -> StoreResult<()> {
        let now = Instant::now();
        let log = self.counter(key, window, now);
        let mut log = log.lock();
        log.window = window;
        log.prune(now);
        log.events.push_back((now, weight));
        log.total += weight;
        log.last_touched = now;
        Ok(())
    }

    async fn remove_counters(&self, prefix: &str) -> StoreResult<usize> {
        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|key, _| !key.starts_with(prefix));
        Ok(before - counters.len())
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let now = Instant::now();
        let stored = self.values.read().get(key).cloned();
        match stored {
            Some(StoredValue {
                expires_at: Some(expires_at),
                ..
            }) if expires_at <= now => {
                self.values.write().remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value)),
            None => Ok(None),
        }
    }

    async fn put_value(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.values
            .write()
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete_value(&self, key: &str) -> StoreResult<bool> {
        Ok(self.values.write().remove(key).is_some())
    }

    async fn push_violation(&self, violation: RateLimitViolation, keep: usize) -> StoreResult<()> {
        let mut violations = self.violations.write();
        let list = violations.entry(violation.client_id.clone()).or_default();
        list.push_front(violation);
        list.truncate(keep);
        Ok(())
    }

    async fn violations(&self, client_id: &str) -> StoreResult<Vec<RateLimitViolation>> {
        Ok(self
            .violations
            .read()
            .get(client_id)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn purge_idle(&self, grace: Duration) -> StoreResult<usize> {
        let now = Instant::now();
        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|_, log| {
            let log = log.lock();
            now.duration_since(log.last_touched) < log.window + grace
        });
        Ok(before - counters.len())
    }
}
