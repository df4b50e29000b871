// ARCHITECTURE: Model Cache - Single-Flight Loading with LRU and TTL Reclamation
//
// DESIGN PHILOSOPHY:
// 1. SINGLE-FLIGHT: a cold key gets exactly one load; concurrent callers join
//    the in-flight token and all observe the same handle or the same failure
// 2. STRICT LRU: before inserting at capacity, the least recently accessed
//    entry goes first (ties broken by a monotonic access sequence)
// 3. DEFERRED RELEASE: eviction only makes a key undiscoverable; the predictor
//    is freed when the last outstanding lease drops
// 4. TTL RECLAMATION: a background sweep unloads entries idle beyond the TTL
//
// LOCK ORDER:
// `in_flight` before `resident`. Neither is ever held across an await.
//
// PRODUCTION REQUIREMENTS MET:
// ✅ Bounded memory via capacity limit
// ✅ Loads survive waiter timeouts and cancellation
// ✅ Failed loads release their token and are never retried implicitly
// ✅ Predictions in progress are never disrupted by eviction

use std::{
    collections::{BTreeMap, HashMap},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use super::{
    artifact::{ArtifactStore, ModelVersionSource},
    registry::LoaderRegistry,
    traits::{BoxedPredictor, FeatureRow, PredictorInfo, RawPrediction},
};
use crate::error::{Error, Result};

// CONFIGURATION: ModelCacheConfig - Capacity and Reclamation Parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCacheConfig {
    pub max_models: usize,                 // Resident models before LRU eviction (default: 10)
    pub ttl_seconds: u64,                  // Idle time before reclamation (default: 24h)
    pub reap_interval_seconds: u64,        // Reclamation sweep period (default: 1h)
    pub load_wait_timeout_ms: Option<u64>, // Max wait on a cold load, None waits forever
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            max_models: 10,
            ttl_seconds: 24 * 3_600,
            reap_interval_seconds: 3_600,
            load_wait_timeout_ms: None,
        }
    }
}

// Failure shared by every caller that joined one load.
#[derive(Debug, Clone)]
enum LoadFailure {
    NotFound(String),
    Load(String),
}

impl From<LoadFailure> for Error {
    fn from(failure: LoadFailure) -> Self {
        match failure {
            LoadFailure::NotFound(key) => Error::ModelNotFound(key),
            LoadFailure::Load(message) => Error::ModelLoad(message),
        }
    }
}

type LoadOutcome = std::result::Result<Arc<LoadedModel>, LoadFailure>;

/// A predictor plus what the cache knows about where it came from. Dropped,
/// and its memory released, once no entry and no lease references it.
#[derive(Debug)]
pub struct LoadedModel {
    key: String,
    predictor: BoxedPredictor,
    framework: String,
    artifact_path: String,
    content_hash: String,
    size_bytes: u64,
    loaded_at: DateTime<Utc>,
    active_leases: AtomicUsize,
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        debug!(model_version_id = %self.key, "🗑️ Model handle released");
    }
}

/// Borrowed access to a cached model. Holding one keeps the predictor alive
/// even after the cache has evicted or unloaded its key.
#[derive(Debug)]
pub struct ModelLease {
    model: Arc<LoadedModel>,
}

impl ModelLease {
    fn new(model: Arc<LoadedModel>) -> Self {
        model.active_leases.fetch_add(1, Ordering::SeqCst);
        Self { model }
    }

    pub fn predict(&self, rows: &[FeatureRow]) -> anyhow::Result<Vec<RawPrediction>> {
        self.model.predictor.predict(rows)
    }

    pub fn is_healthy(&self) -> bool {
        predictor_healthy(&self.model)
    }

    pub fn info(&self) -> PredictorInfo {
        self.model.predictor.info()
    }

    pub fn key(&self) -> &str {
        &self.model.key
    }

    pub fn framework(&self) -> &str {
        &self.model.framework
    }

    pub fn content_hash(&self) -> &str {
        &self.model.content_hash
    }

    /// True when both leases reference the same load result.
    pub fn same_model(&self, other: &ModelLease) -> bool {
        Arc::ptr_eq(&self.model, &other.model)
    }
}

impl Clone for ModelLease {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.model))
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.model.active_leases.fetch_sub(1, Ordering::SeqCst);
    }
}

fn predictor_healthy(model: &LoadedModel) -> bool {
    catch_unwind(AssertUnwindSafe(|| model.predictor.is_healthy())).unwrap_or(false)
}

struct CacheEntry {
    model: Arc<LoadedModel>,
    last_accessed_at: DateTime<Utc>,
    last_accessed: Instant,
    access_seq: u64,
}

/// Row of `loaded_models()`.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedModelInfo {
    pub model_version_id: String,
    pub framework: String,
    pub artifact_path: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub loaded_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub active_leases: usize,
    pub healthy: bool,
}

/// Residency for the whole cache, or for one model when a key is given.
/// `available_slots` always describes the whole cache.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub loaded_models_count: usize,
    pub available_slots: usize,         // Free slots before eviction starts (cache-wide)
    pub total_artifact_bytes: u64,
    pub models: BTreeMap<String, u64>, // model_version_id -> artifact size
}

// METRICS: CacheStats - Operational Intelligence
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub reclaimed: u64,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
    reclaimed: AtomicU64,
}

struct CacheInner {
    config: ModelCacheConfig,
    resident: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<LoadOutcome>>>>,
    access_seq: AtomicU64,
    versions: Arc<dyn ModelVersionSource>,
    artifacts: Arc<dyn ArtifactStore>,
    loaders: Arc<LoaderRegistry>,
    counters: CacheCounters,
}

// CORE SYSTEM: ModelCache - Resident Model Set
pub struct ModelCache {
    inner: Arc<CacheInner>,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ModelCache {
    pub fn new(
        config: ModelCacheConfig,
        versions: Arc<dyn ModelVersionSource>,
        artifacts: Arc<dyn ArtifactStore>,
        loaders: Arc<LoaderRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                resident: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                access_seq: AtomicU64::new(0),
                versions,
                artifacts,
                loaders,
                counters: CacheCounters::default(),
            }),
            reaper_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ModelCacheConfig {
        &self.inner.config
    }

    /// Resident model for `key`, loading it on a miss. Concurrent misses on
    /// one key share a single load.
    pub async fn get_or_load(&self, key: &str) -> Result<ModelLease> {
        if let Some(model) = self.inner.touch(key) {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(ModelLease::new(model));
        }

        let mut receiver = {
            let mut in_flight = self.inner.in_flight.lock();
            // A load may have finished between the first probe and taking the lock.
            if let Some(model) = self.inner.touch(key) {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(ModelLease::new(model));
            }
            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);

            match in_flight.get(key) {
                Some(receiver) => {
                    debug!(model_version_id = %key, "Joining in-flight model load");
                    receiver.clone()
                }
                None => {
                    let (sender, receiver) = watch::channel(None);
                    in_flight.insert(key.to_string(), receiver.clone());
                    let inner = Arc::clone(&self.inner);
                    let key = key.to_string();
                    tokio::spawn(async move { inner.run_load(key, sender).await });
                    receiver
                }
            }
        };

        let model = self.await_load(key, &mut receiver).await?;
        Ok(ModelLease::new(model))
    }

    async fn await_load(
        &self,
        key: &str,
        receiver: &mut watch::Receiver<Option<LoadOutcome>>,
    ) -> Result<Arc<LoadedModel>> {
        let wait_timeout = self.inner.config.load_wait_timeout_ms.map(Duration::from_millis);

        let outcome = {
            let wait = receiver.wait_for(Option::is_some);
            let ready = match wait_timeout {
                Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                    Error::ModelLoadTimeout {
                        key: key.to_string(),
                        waited_ms: limit.as_millis() as u64,
                    }
                })?,
                None => wait.await,
            };
            let ready = ready.map_err(|_| {
                Error::ModelLoad(format!("load of {key} ended without reporting a result"))
            })?;
            (*ready).clone()
        };

        match outcome {
            Some(Ok(model)) => Ok(model),
            Some(Err(failure)) => Err(failure.into()),
            None => Err(Error::Internal(format!("load of {key} reported no outcome"))),
        }
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.inner.resident.lock().contains_key(key)
    }

    /// Make `key` undiscoverable. The predictor is released once every
    /// lease on it has dropped.
    pub fn unload(&self, key: &str) -> bool {
        let removed = self.inner.resident.lock().remove(key);
        match removed {
            Some(entry) => {
                info!(
                    model_version_id = %key,
                    active_leases = entry.model.active_leases.load(Ordering::SeqCst),
                    "📤 Model unloaded"
                );
                true
            }
            None => false,
        }
    }

    /// Unload and load again from the artifact store.
    pub async fn reload(&self, key: &str) -> Result<ModelLease> {
        info!(model_version_id = %key, "🔄 Reloading model");
        self.unload(key);
        self.get_or_load(key).await
    }

    /// Health of a resident model. A missing model or a panicking check is
    /// unhealthy.
    pub fn check_health(&self, key: &str) -> bool {
        let model = self
            .inner
            .resident
            .lock()
            .get(key)
            .map(|entry| Arc::clone(&entry.model));
        match model {
            Some(model) => {
                let healthy = predictor_healthy(&model);
                if !healthy {
                    warn!(model_version_id = %key, "Model health check failed");
                }
                healthy
            }
            None => false,
        }
    }

    pub fn memory_usage(&self, key: Option<&str>) -> MemoryUsage {
        let resident = self.inner.resident.lock();
        let models: BTreeMap<String, u64> = resident
            .iter()
            .filter(|(k, _)| key.map_or(true, |wanted| wanted == k.as_str()))
            .map(|(k, entry)| (k.clone(), entry.model.size_bytes))
            .collect();
        MemoryUsage {
            loaded_models_count: models.len(),
            available_slots: self.inner.config.max_models.saturating_sub(resident.len()),
            total_artifact_bytes: models.values().sum(),
            models,
        }
    }

    pub fn loaded_models(&self) -> Vec<LoadedModelInfo> {
        let snapshot: Vec<(Arc<LoadedModel>, DateTime<Utc>)> = self
            .inner
            .resident
            .lock()
            .values()
            .map(|entry| (Arc::clone(&entry.model), entry.last_accessed_at))
            .collect();

        let mut models: Vec<_> = snapshot
            .into_iter()
            .map(|(model, last_accessed_at)| LoadedModelInfo {
                model_version_id: model.key.clone(),
                framework: model.framework.clone(),
                artifact_path: model.artifact_path.clone(),
                content_hash: model.content_hash.clone(),
                size_bytes: model.size_bytes,
                loaded_at: model.loaded_at,
                last_accessed_at,
                active_leases: model.active_leases.load(Ordering::SeqCst),
                healthy: predictor_healthy(&model),
            })
            .collect();
        models.sort_by(|a, b| a.model_version_id.cmp(&b.model_version_id));
        models
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            load_failures: c.load_failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            reclaimed: c.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Unload every entry idle for longer than the TTL. Returns the keys removed.
    pub fn reclaim_idle(&self) -> Vec<String> {
        self.inner.reclaim_idle()
    }

    // LIFECYCLE: Start the TTL sweep
    pub fn start(&self) {
        let mut handle_slot = self.reaper_handle.lock();
        if handle_slot.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let period = Duration::from_secs(self.inner.config.reap_interval_seconds.max(1));
        *handle_slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.reclaim_idle();
            }
        }));

        info!(
            max_models = self.inner.config.max_models,
            ttl_seconds = self.inner.config.ttl_seconds,
            "🧠 Model cache started"
        );
    }

    // LIFECYCLE: Stop the sweep. Resident models stay loaded.
    pub fn stop(&self) {
        if let Some(handle) = self.reaper_handle.lock().take() {
            handle.abort();
            info!("Model cache reaper stopped");
        }
    }
}

impl Drop for ModelCache {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper_handle.get_mut().take() {
            handle.abort();
        }
    }
}

impl CacheInner {
    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn touch(&self, key: &str) -> Option<Arc<LoadedModel>> {
        let mut resident = self.resident.lock();
        let entry = resident.get_mut(key)?;
        entry.last_accessed_at = Utc::now();
        entry.last_accessed = Instant::now();
        entry.access_seq = self.next_seq();
        Some(Arc::clone(&entry.model))
    }

    // Runs on its own task so that waiters giving up never cancel the load.
    async fn run_load(self: Arc<Self>, key: String, sender: watch::Sender<Option<LoadOutcome>>) {
        let started = Instant::now();
        self.counters.loads.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self);
        let load_key = key.clone();
        let outcome = match tokio::spawn(async move { inner.load_model(&load_key).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(LoadFailure::Load(format!("load task failed: {e}"))),
        };

        match &outcome {
            Ok(model) => info!(
                model_version_id = %key,
                framework = %model.framework,
                size_bytes = model.size_bytes,
                load_ms = started.elapsed().as_millis() as u64,
                "✅ Model loaded"
            ),
            Err(failure) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                error!(model_version_id = %key, failure = ?failure, "❌ Model load failed");
            }
        }

        let mut in_flight = self.in_flight.lock();
        if let Ok(model) = &outcome {
            self.insert(&key, Arc::clone(model));
        }
        in_flight.remove(&key);
        sender.send_replace(Some(outcome));
    }

    async fn load_model(&self, key: &str) -> LoadOutcome {
        let record = self
            .versions
            .model_version(key)
            .await
            .map_err(|e| LoadFailure::Load(format!("model version lookup failed: {e:#}")))?
            .ok_or_else(|| LoadFailure::NotFound(key.to_string()))?;

        let loader = self.loaders.resolve(&record.framework).ok_or_else(|| {
            LoadFailure::Load(format!("unsupported framework '{}'", record.framework))
        })?;

        let artifact = self
            .artifacts
            .fetch(&record.artifact_path)
            .await
            .map_err(|e| LoadFailure::Load(format!("{e:#}")))?;
        let size_bytes = artifact.size_bytes();
        let content_hash = artifact.content_hash.clone();

        let predictor = tokio::task::spawn_blocking(move || loader.load(&artifact))
            .await
            .map_err(|e| LoadFailure::Load(format!("loader task failed: {e}")))?
            .map_err(|e| LoadFailure::Load(format!("{e:#}")))?;

        Ok(Arc::new(LoadedModel {
            key: key.to_string(),
            predictor,
            framework: record.framework,
            artifact_path: record.artifact_path,
            content_hash,
            size_bytes,
            loaded_at: Utc::now(),
            active_leases: AtomicUsize::new(0),
        }))
    }

    // Caller holds `in_flight`.
    fn insert(&self, key: &str, model: Arc<LoadedModel>) {
        let mut resident = self.resident.lock();
        let capacity = self.config.max_models.max(1);

        while resident.len() >= capacity && !resident.contains_key(key) {
            let victim = resident
                .iter()
                .min_by_key(|(_, entry)| entry.access_seq)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = resident.remove(&victim) {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                info!(
                    model_version_id = %victim,
                    active_leases = entry.model.active_leases.load(Ordering::SeqCst),
                    "♻️ Evicted least recently used model"
                );
            }
        }

        resident.insert(
            key.to_string(),
            CacheEntry {
                model,
                last_accessed_at: Utc::now(),
                last_accessed: Instant::now(),
                access_seq: self.next_seq(),
            },
        );
    }

    fn reclaim_idle(&self) -> Vec<String> {
        let ttl = Duration::from_secs(self.config.ttl_seconds);
        let now = Instant::now();
        let mut resident = self.resident.lock();
        let expired: Vec<String> = resident
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_accessed) > ttl)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            resident.remove(key);
            self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
            info!(model_version_id = %key, "⏰ Unloaded idle model");
        }
        expired
    }
}
