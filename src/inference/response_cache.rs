// PERFORMANCE OPTIMIZATION: Response Cache for Repeated Prediction Requests
// Identical instance lists against the same deployment skip validation and
// prediction entirely.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{sync::RwLock, time::Instant};

use super::types::PredictionResponse;

pub struct ResponseCache {
    cache: Arc<RwLock<HashMap<String, CachedResponse>>>,
    max_size: usize,
    ttl: Duration,
}

#[derive(Clone)]
struct CachedResponse {
    response: PredictionResponse,
    created_at: Instant,
    access_count: u64,
}

impl ResponseCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            max_size,
            ttl,
        }
    }

    /// `inference:{deployment}:{blake3 of the serialized instances}`
    pub fn cache_key(deployment_id: &str, instances: &[Value]) -> String {
        // serde_json maps are ordered, so equal instances serialize identically.
        let canonical = serde_json::to_vec(instances).unwrap_or_default();
        let hash = blake3::hash(&canonical);
        format!("inference:{deployment_id}:{}", hash.to_hex())
    }

    pub async fn get(&self, key: &str) -> Option<PredictionResponse> {
        let mut cache = self.cache.write().await;
        match cache.get_mut(key) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => {
                entry.access_count += 1;
                tracing::debug!("🚀 Cache HIT: prediction served from cache");
                Some(entry.response.clone())
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key: String, response: PredictionResponse) {
        let mut cache = self.cache.write().await;
        if cache.len() >= self.max_size && !cache.contains_key(&key) {
            self.evict_one(&mut cache);
        }
        cache.insert(
            key,
            CachedResponse {
                response,
                created_at: Instant::now(),
                access_count: 1,
            },
        );
    }

    // Expired entries first, otherwise the least used and oldest.
    fn evict_one(&self, cache: &mut HashMap<String, CachedResponse>) {
        let victim = cache
            .iter()
            .find(|(_, v)| v.created_at.elapsed() >= self.ttl)
            .or_else(|| {
                cache
                    .iter()
                    .min_by_key(|(_, v)| (v.access_count, v.created_at))
            })
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            cache.remove(&key);
            tracing::debug!("🗑️ Evicted response cache entry");
        }
    }

    /// Drop every entry. Returns how many were cached.
    pub async fn clear(&self) -> usize {
        let mut cache = self.cache.write().await;
        let dropped = cache.len();
        cache.clear();
        dropped
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
