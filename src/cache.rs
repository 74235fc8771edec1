//! Two-tier cache.
//!
//! L1 is an in-process map; L2 is the [`SharedStore`]. Reads go L1 → L2 and
//! an L2 hit repopulates L1. Writes go to both tiers at once. The cache is
//! best effort: shared-tier failures are logged and counted, and only
//! [`MultiLevelCache::try_get`] returns them.

use crate::error::GatewayResult;
use crate::metrics::{CacheOperation, MetricsCollector};
use crate::store::SharedStore;
use crate::tasks::PeriodicTask;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Where a lookup was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitLevel {
    L1,
    L2,
    Miss,
}

/// Independent lifetimes for the two tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
    pub fast: Duration,
    pub shared: Duration,
}

impl CacheTtl {
    pub fn new(fast: Duration, shared: Duration) -> Self {
        Self { fast, shared }
    }

    /// Same lifetime in both tiers.
    pub fn uniform(ttl: Duration) -> Self {
        Self { fast: ttl, shared: ttl }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix applied to every key in the shared tier.
    pub namespace: String,
    pub default_ttl: CacheTtl,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "covergate".to_string(),
            default_ttl: CacheTtl::new(Duration::from_secs(300), Duration::from_secs(3600)),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub evictions: u64,
    pub l1_entries: usize,
    pub hit_rate: f64,
    pub backend: String,
}

pub struct MultiLevelCache {
    local: DashMap<String, LocalEntry>,
    shared: Arc<dyn SharedStore>,
    config: CacheConfig,
    counters: Counters,
    metrics: Option<Arc<MetricsCollector>>,
}

impl MultiLevelCache {
    pub fn new(shared: Arc<dyn SharedStore>, config: CacheConfig) -> Self {
        Self {
            local: DashMap::new(),
            shared,
            config,
            counters: Counters::default(),
            metrics: None,
        }
    }

    /// Reports every operation to `metrics` as a cache sample.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn default_ttl(&self) -> CacheTtl {
        self.config.default_ttl
    }

    fn shared_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.namespace, key)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_with_level(key).await.0
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(target: "covergate::cache", key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Looks `key` up and reports which tier answered.
    pub async fn get_with_level(&self, key: &str) -> (Option<Value>, HitLevel) {
        let started = Instant::now();
        let (value, level) = match self.lookup(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(target: "covergate::cache", key, error = %e, "Shared tier read failed, serving from local tier only");
                (None, HitLevel::Miss)
            }
        };
        self.record_lookup(key, level, started).await;
        (value, level)
    }

    /// Like [`get`](Self::get), but a shared-tier failure is returned
    /// instead of being read as a miss.
    pub async fn try_get(&self, key: &str) -> GatewayResult<Option<Value>> {
        let started = Instant::now();
        let (value, level) = self.lookup(key).await?;
        self.record_lookup(key, level, started).await;
        Ok(value)
    }

    async fn record_lookup(&self, key: &str, level: HitLevel, started: Instant) {
        match level {
            HitLevel::L1 => self.counters.l1_hits.fetch_add(1, Ordering::Relaxed),
            HitLevel::L2 => self.counters.l2_hits.fetch_add(1, Ordering::Relaxed),
            HitLevel::Miss => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };
        if let Some(metrics) = &self.metrics {
            metrics
                .record_cache(CacheOperation::Get, Some(level), started.elapsed())
                .await;
        }
        debug!(target: "covergate::cache", key, level = ?level, "Cache lookup");
    }

    async fn lookup(&self, key: &str) -> GatewayResult<(Option<Value>, HitLevel)> {
        let now = Instant::now();
        let mut expired = false;
        if let Some(entry) = self.local.get(key) {
            if entry.expires_at > now {
                return Ok((Some(entry.value.clone()), HitLevel::L1));
            }
            expired = true;
        }
        if expired {
            self.local.remove_if(key, |_, e| e.expires_at <= now);
        }

        let stored = match self.shared.get(&self.shared_key(key)).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok((None, HitLevel::Miss)),
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let value: Value = match serde_json::from_str(&stored.value) {
            Ok(value) => value,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(target: "covergate::cache", key, error = %e, "Discarding undecodable shared entry");
                return Ok((None, HitLevel::Miss));
            }
        };

        let fast_ttl = match stored.ttl {
            Some(remaining) => remaining.min(self.config.default_ttl.fast),
            None => self.config.default_ttl.fast,
        };
        self.insert_local(key, value.clone(), fast_ttl);

        Ok((Some(value), HitLevel::L2))
    }

    /// Writes to both tiers concurrently.
    pub async fn set(&self, key: &str, value: Value, ttl: CacheTtl) {
        let started = Instant::now();
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        let shared_key = self.shared_key(key);
        let encoded = value.to_string();
        let shared_write = self.shared.set(&shared_key, &encoded, ttl.shared);
        let local_write = async {
            self.insert_local(key, value, ttl.fast);
        };
        let (shared_result, ()) = tokio::join!(shared_write, local_write);

        if let Err(e) = shared_result {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(target: "covergate::cache", key, error = %e, "Shared tier write failed, value cached locally only");
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .record_cache(CacheOperation::Set, None, started.elapsed())
                .await;
        }
    }

    pub async fn set_default(&self, key: &str, value: Value) {
        self.set(key, value, self.config.default_ttl).await
    }

    /// Serializes `value` and caches it; serialization failures are logged.
    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T, ttl: CacheTtl) {
        match serde_json::to_value(value) {
            Ok(json) => self.set(key, json, ttl).await,
            Err(e) => warn!(target: "covergate::cache", key, error = %e, "Value not cacheable"),
        }
    }

    pub async fn delete(&self, key: &str) {
        let started = Instant::now();
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.local.remove(key);
        if let Err(e) = self.shared.delete(&self.shared_key(key)).await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(target: "covergate::cache", key, error = %e, "Shared tier delete failed");
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .record_cache(CacheOperation::Delete, None, started.elapsed())
                .await;
        }
    }

    /// Removes every key starting with `prefix` from both tiers.
    pub async fn delete_prefix(&self, prefix: &str) -> usize {
        let before = self.local.len();
        self.local.retain(|key, _| !key.starts_with(prefix));
        let mut removed = before.saturating_sub(self.local.len());

        match self.shared.delete_prefix(&self.shared_key(prefix)).await {
            Ok(n) => removed = removed.max(n as usize),
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(target: "covergate::cache", prefix, error = %e, "Shared tier prefix delete failed");
            }
        }
        self.counters
            .deletes
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub async fn clear(&self) {
        self.local.clear();
        let namespace = format!("{}:", self.config.namespace);
        if let Err(e) = self.shared.delete_prefix(&namespace).await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(target: "covergate::cache", error = %e, "Shared tier clear failed");
        }
    }

    /// Drops expired local entries; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.local.len());
        self.counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> PeriodicTask {
        let cache = self.clone();
        PeriodicTask::spawn("cache-sweep", interval, move || {
            let cache = cache.clone();
            async move {
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(target: "covergate::cache", removed, "Swept expired local entries");
                }
            }
        })
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn stats(&self) -> CacheStats {
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = l1_hits + l2_hits + misses;

        CacheStats {
            l1_hits,
            l2_hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            l1_entries: self.local.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (l1_hits + l2_hits) as f64 / lookups as f64
            },
            backend: self.shared.backend().to_string(),
        }
    }

    fn insert_local(&self, key: &str, value: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if self.local.len() >= self.config.max_entries && !self.local.contains_key(key) {
            self.make_room();
        }
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Evicts expired entries, then the entry closest to expiry if still full.
    fn make_room(&self) {
        if self.sweep_expired() > 0 && self.local.len() < self.config.max_entries {
            return;
        }
        let victim = self
            .local
            .iter()
            .min_by_key(|entry| entry.expires_at)
            .map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            self.local.remove(&victim);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn cache_with(store: Arc<MemoryStore>) -> MultiLevelCache {
        MultiLevelCache::new(store, CacheConfig::default())
    }

    #[tokio::test]
    async fn test_l1_hit_after_set() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        cache.set("k", json!({"a": 1}), CacheTtl::uniform(Duration::from_secs(5))).await;
        let (value, level) = cache.get_with_level("k").await;
        assert_eq!(value, Some(json!({"a": 1})));
        assert_eq!(level, HitLevel::L1);
    }

    #[tokio::test]
    async fn test_repeated_get_is_idempotent() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        cache.set("k", json!([1, 2, 3]), CacheTtl::uniform(Duration::from_secs(5))).await;
        let first = cache.get("k").await;
        for _ in 0..5 {
            assert_eq!(cache.get("k").await, first);
        }
    }

    #[tokio::test]
    async fn test_shared_tier_repopulates_local() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        cache
            .set(
                "k",
                json!({"a": 1}),
                CacheTtl::new(Duration::from_millis(50), Duration::from_millis(5000)),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        let (value, level) = cache.get_with_level("k").await;
        assert_eq!(value, Some(json!({"a": 1})));
        assert_eq!(level, HitLevel::L2);

        let (_, level) = cache.get_with_level("k").await;
        assert_eq!(level, HitLevel::L1);

        let stats = cache.stats();
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.l1_hits, 1);
    }

    #[tokio::test]
    async fn test_shared_outage_degrades_to_local() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        store.set_available(false);

        cache.set("k", json!("v"), CacheTtl::uniform(Duration::from_secs(5))).await;
        assert_eq!(cache.get("k").await, Some(json!("v")));
        assert_eq!(cache.get("missing").await, None);
        assert!(cache.stats().errors >= 2);
    }

    #[tokio::test]
    async fn test_try_get_surfaces_shared_outage() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        cache.set("local", json!(1), CacheTtl::uniform(Duration::from_secs(5))).await;
        store.set_available(false);

        assert_eq!(cache.try_get("local").await.unwrap(), Some(json!(1)));
        assert!(cache.try_get("missing").await.is_err());

        store.set_available(true);
        assert_eq!(cache.try_get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_and_prefix_delete() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        let ttl = CacheTtl::uniform(Duration::from_secs(5));
        cache.set("letters:list:u1", json!([]), ttl).await;
        cache.set("letters:list:u2", json!([]), ttl).await;
        cache.set("profile:u1", json!({}), ttl).await;

        cache.delete("profile:u1").await;
        assert_eq!(cache.get("profile:u1").await, None);

        assert_eq!(cache.delete_prefix("letters:list:").await, 2);
        assert_eq!(cache.get("letters:list:u1").await, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_and_capacity() {
        let store = Arc::new(MemoryStore::new());
        let cache = MultiLevelCache::new(
            store,
            CacheConfig {
                max_entries: 2,
                ..CacheConfig::default()
            },
        );
        cache.set("short", json!(1), CacheTtl::new(Duration::from_millis(10), Duration::from_secs(5))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.sweep_expired(), 1);

        let ttl = CacheTtl::uniform(Duration::from_secs(5));
        cache.set("a", json!(1), ttl).await;
        cache.set("b", json!(2), ttl).await;
        cache.set("c", json!(3), ttl).await;
        assert_eq!(cache.local_len(), 2);
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Profile {
            name: String,
        }
        let cache = cache_with(Arc::new(MemoryStore::new()));
        let profile = Profile { name: "Ada".into() };
        cache.set_as("p", &profile, CacheTtl::uniform(Duration::from_secs(5))).await;
        assert_eq!(cache.get_as::<Profile>("p").await, Some(profile));
        assert_eq!(cache.get_as::<u32>("p").await, None);
    }

    #[tokio::test]
    async fn test_lookups_reported_to_metrics() {
        let metrics = Arc::new(MetricsCollector::new(100));
        let cache = cache_with(Arc::new(MemoryStore::new())).with_metrics(metrics.clone());
        cache.get("nothing").await;
        cache.set("k", json!(1), CacheTtl::uniform(Duration::from_secs(5))).await;
        cache.get("k").await;
        let agg = metrics.latest(Duration::from_secs(60)).await;
        assert_eq!(agg.cache.lookups, 2);
        assert_eq!(agg.cache.l1_hits, 1);
    }
}
