//! Durable key/value caching with an in-process fallback.
//!
//! [`KvCache`] fronts the external cache service (Redis). When the service
//! is unreachable — at startup or mid-flight — reads and writes silently
//! degrade to a bounded in-process map of the most recent keys. A cache
//! outage never fails the caller; it only costs recomputation.
//!
//! [`EmbeddingCache`] layers the `get_or_compute` contract on top: a hit
//! within TTL returns the stored vector with no upstream call, and
//! concurrent misses for the same key are coalesced so only one remote
//! embed is paid for.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::CacheConfig;
use crate::embedding::{EmbedInput, EmbeddingBackend};

/// Which backing store actually served an operation. Callers that care
/// about degraded state can inspect this instead of guessing from logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Redis,
    Local,
}

/// Budget for a single cache-service round trip. A slow cache must not
/// stall lookups; past this we fall back to the local map.
const REDIS_OP_TIMEOUT: Duration = Duration::from_secs(2);

// ============ In-process fallback ============

/// Bounded most-recent-N map used when the cache service is unavailable.
struct LocalCache {
    entries: HashMap<String, (Vec<u8>, Instant)>,
    order: VecDeque<String>,
    capacity: usize,
}

impl LocalCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        match self.entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                // Expired entries are misses, not errors.
                self.entries.remove(key);
                self.order.retain(|k| k != key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Duration) {
        if self
            .entries
            .insert(key.to_string(), (value, Instant::now() + ttl))
            .is_some()
        {
            self.order.retain(|k| k != key);
        }
        self.order.push_back(key.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}

// ============ KvCache ============

/// TTL'd key/value store backed by the external cache service, with a
/// process-local bounded fallback.
pub struct KvCache {
    redis: Option<redis::aio::ConnectionManager>,
    ttl: Duration,
    local: Mutex<LocalCache>,
}

impl KvCache {
    /// Connect to the configured cache service. Connectivity failure is not
    /// an error: the cache degrades to local-only and the process keeps
    /// serving.
    pub async fn connect(config: &CacheConfig) -> Arc<KvCache> {
        let url = format!("redis://{}:{}/", config.host, config.port);
        let redis = match redis::Client::open(url.as_str()) {
            Ok(client) => {
                match tokio::time::timeout(
                    REDIS_OP_TIMEOUT,
                    redis::aio::ConnectionManager::new(client),
                )
                .await
                {
                    Ok(Ok(manager)) => {
                        tracing::info!(url = %url, "cache service connected");
                        Some(manager)
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "cache service unavailable, using in-process fallback");
                        None
                    }
                    Err(_) => {
                        tracing::warn!("cache service connect timed out, using in-process fallback");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "invalid cache service address, using in-process fallback");
                None
            }
        };

        Arc::new(KvCache {
            redis,
            ttl: Duration::from_secs(config.ttl_secs),
            local: Mutex::new(LocalCache::new(config.local_capacity)),
        })
    }

    /// A cache with no external service attached. Used by tests and by
    /// deployments that explicitly run without a cache host.
    pub fn local_only(config: &CacheConfig) -> Arc<KvCache> {
        Arc::new(KvCache {
            redis: None,
            ttl: Duration::from_secs(config.ttl_secs),
            local: Mutex::new(LocalCache::new(config.local_capacity)),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read a key. Returns the value and which backend served it, or
    /// `None` on a miss. Never returns an error: a failing cache service
    /// degrades to the local map.
    pub async fn get(&self, key: &str) -> Option<(Vec<u8>, CacheBackend)> {
        if let Some(manager) = &self.redis {
            let mut conn = manager.clone();
            let fetched = tokio::time::timeout(
                REDIS_OP_TIMEOUT,
                redis::AsyncCommands::get::<_, Option<Vec<u8>>>(&mut conn, key),
            )
            .await;
            match fetched {
                Ok(Ok(Some(value))) => return Some((value, CacheBackend::Redis)),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "cache read failed, trying in-process fallback");
                }
                Err(_) => {
                    tracing::warn!("cache read timed out, trying in-process fallback");
                }
            }
        }

        self.local
            .lock()
            .await
            .get(key)
            .map(|v| (v, CacheBackend::Local))
    }

    /// Write a key with the configured TTL. The write is atomic per key
    /// (single SET). Also written through to the local fallback so a later
    /// outage still has the most recent values.
    pub async fn set(&self, key: &str, value: &[u8]) {
        if self.ttl.is_zero() {
            return;
        }

        if let Some(manager) = &self.redis {
            let mut conn = manager.clone();
            let stored = tokio::time::timeout(
                REDIS_OP_TIMEOUT,
                redis::AsyncCommands::set_ex::<_, _, ()>(
                    &mut conn,
                    key,
                    value,
                    self.ttl.as_secs(),
                ),
            )
            .await;
            match stored {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "cache write failed"),
                Err(_) => tracing::warn!("cache write timed out"),
            }
        }

        self.local
            .lock()
            .await
            .set(key, value.to_vec(), self.ttl);
    }

    /// Read and deserialize a JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let (bytes, _) = self.get(key).await?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Serialize and write a JSON value.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).context("Failed to serialize cache value")?;
        self.set(key, &bytes).await;
        Ok(())
    }
}

// ============ Key derivation ============

/// Collapse whitespace and trim; identical queries with different spacing
/// share a cache entry.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cache key for an embedding: hash of normalized text + model + usage.
pub fn embed_key(text: &str, model_id: &str, input: EmbedInput) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hasher.update([0u8]);
    hasher.update(model_id.as_bytes());
    hasher.update([match input {
        EmbedInput::Document => b'd',
        EmbedInput::Query => b'q',
    }]);
    format!("embed:{:x}", hasher.finalize())
}

/// Cache key for a synthesis result: hash of the normalized query.
pub fn synthesis_key(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(query).as_bytes());
    format!("synth:{:x}", hasher.finalize())
}

// ============ Vector encoding ============

/// Encode a float vector as little-endian f32 bytes.
fn vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector.
fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ============ EmbeddingCache ============

/// Cached front for the remote embedding capability.
pub struct EmbeddingCache {
    kv: Arc<KvCache>,
    backend: Arc<dyn EmbeddingBackend>,
    /// Per-key guards so concurrent misses issue a single upstream call.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EmbeddingCache {
    pub fn new(kv: Arc<KvCache>, backend: Arc<dyn EmbeddingBackend>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            backend,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    /// Return the embedding for `text`, computing it at most once per key
    /// across concurrent callers.
    ///
    /// A hit within TTL makes no upstream call. On a miss the first caller
    /// computes and stores; waiters pick the value up from the cache once
    /// the guard releases. If the store could not retain the value (cache
    /// outage with a cold local map), late callers recompute directly
    /// rather than stalling on the outage.
    pub async fn get_or_compute(&self, text: &str, input: EmbedInput) -> Result<Vec<f32>> {
        let key = embed_key(text, self.backend.model_id(), input);

        if let Some((bytes, _)) = self.kv.get(&key).await {
            return Ok(bytes_to_vec(&bytes));
        }

        let guard = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;

        // A concurrent caller may have filled the cache while we waited.
        if let Some((bytes, _)) = self.kv.get(&key).await {
            return Ok(bytes_to_vec(&bytes));
        }

        let normalized = normalize_text(text);
        let vectors = self.backend.embed(&[normalized], input).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;

        self.kv.set(&key, &vec_to_bytes(&vector)).await;

        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&key);
        }

        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        calls: AtomicUsize,
        dims: usize,
    }

    impl CountingBackend {
        fn new(dims: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                dims,
            })
        }
    }

    #[async_trait]
    impl EmbeddingBackend for CountingBackend {
        fn model_id(&self) -> &str {
            "test-model"
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String], _input: EmbedInput) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; self.dims];
                    v[0] = t.len() as f32;
                    v
                })
                .collect())
        }
    }

    fn test_cache(ttl_secs: u64) -> Arc<KvCache> {
        KvCache::local_only(&CacheConfig {
            ttl_secs,
            local_capacity: 8,
            ..CacheConfig::default()
        })
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let backend = CountingBackend::new(4);
        let cache = EmbeddingCache::new(test_cache(3600), backend.clone());

        let first = cache
            .get_or_compute("tenant rights", EmbedInput::Query)
            .await
            .unwrap();
        let second = cache
            .get_or_compute("tenant rights", EmbedInput::Query)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn whitespace_variants_share_an_entry() {
        let backend = CountingBackend::new(4);
        let cache = EmbeddingCache::new(test_cache(3600), backend.clone());

        cache
            .get_or_compute("fair  housing act", EmbedInput::Query)
            .await
            .unwrap();
        cache
            .get_or_compute("fair housing act", EmbedInput::Query)
            .await
            .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_trigger_recompute() {
        let backend = CountingBackend::new(4);
        // ttl of zero: everything written is already expired.
        let cache = EmbeddingCache::new(test_cache(0), backend.clone());

        cache
            .get_or_compute("statute of limitations", EmbedInput::Query)
            .await
            .unwrap();
        cache
            .get_or_compute("statute of limitations", EmbedInput::Query)
            .await
            .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_pay_for_one_upstream_call() {
        let backend = CountingBackend::new(4);
        let cache = EmbeddingCache::new(test_cache(3600), backend.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("implied warranty of habitability", EmbedInput::Query)
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_and_document_keys_are_distinct() {
        let backend = CountingBackend::new(4);
        let cache = EmbeddingCache::new(test_cache(3600), backend.clone());

        cache
            .get_or_compute("eviction notice", EmbedInput::Query)
            .await
            .unwrap();
        cache
            .get_or_compute("eviction notice", EmbedInput::Document)
            .await
            .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn local_cache_evicts_oldest_beyond_capacity() {
        let kv = test_cache(3600);
        for i in 0..10 {
            kv.set(&format!("k{}", i), b"v").await;
        }
        // capacity is 8: k0 and k1 were evicted
        assert!(kv.get("k0").await.is_none());
        assert!(kv.get("k1").await.is_none());
        let (_, backend) = kv.get("k9").await.unwrap();
        assert_eq!(backend, CacheBackend::Local);
    }

    #[test]
    fn vector_bytes_round_trip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(bytes_to_vec(&vec_to_bytes(&v)), v);
    }
}
