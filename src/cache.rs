//! Lookup/store cache consulted by the orchestrator and the summarizer.
//!
//! The core treats the cache as an external service reached through
//! [`CacheStore`]. [`TtlCache`] is the in-process implementation: LRU
//! eviction at capacity plus a per-entry time-to-live.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::llm::types::{ChatMessage, GenerationConfig};

pub trait CacheStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn set(&self, key: &str, value: V, ttl: Duration);
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub sets: u64,
}

struct Inner<V> {
    entries: LruCache<String, CacheEntry<V>>,
    stats: CacheStats,
}

pub struct TtlCache<V> {
    name: &'static str,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        tracing::debug!(cache = name, capacity = capacity.get(), "cache created");
        Self {
            name,
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<V>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<V: Clone + Send> CacheStore<V> for TtlCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = Instant::now();
        match inner.entries.get(key) {
            None => {
                inner.stats.misses += 1;
                None
            }
            Some(entry) if !entry.is_expired(now) => {
                inner.stats.hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                inner.entries.pop(key);
                inner.stats.expired += 1;
                inner.stats.misses += 1;
                tracing::debug!(cache = self.name, key = %key.get(..8).unwrap_or(key), "cache entry expired");
                None
            }
        }
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        let mut inner = self.lock();
        inner.entries.put(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                created_at: Instant::now(),
                ttl,
            },
        );
        inner.stats.sets += 1;
    }
}

fn digest(material: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn embedding_cache_key(model: &str, text: &str) -> String {
    digest(&format!("{model}:{text}"))
}

pub fn completion_cache_key(
    model: &str,
    system: &str,
    messages: &[ChatMessage],
    gen: &GenerationConfig,
) -> String {
    let history = serde_json::to_string(messages).unwrap_or_default();
    let gen_conf = serde_json::to_string(gen).unwrap_or_default();
    digest(&format!("{model}:{system}:{history}:{gen_conf}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_after_set_hits() {
        let cache: TtlCache<Vec<f32>> = TtlCache::new("test", 4);
        cache.set("k", vec![1.0, 2.0], Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(vec![1.0, 2.0]));
        assert_eq!(cache.get("missing"), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache: TtlCache<String> = TtlCache::new("test", 4);
        cache.set("k", "v".into(), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().expired, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache: TtlCache<u32> = TtlCache::new("test", 2);
        let ttl = Duration::from_secs(60);
        cache.set("a", 1, ttl);
        cache.set("b", 2, ttl);
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3, ttl);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn keys_depend_on_model_and_generation() {
        assert_ne!(embedding_cache_key("m1", "x"), embedding_cache_key("m2", "x"));
        let msgs = vec![ChatMessage::user("hello")];
        let a = completion_cache_key("m", "sys", &msgs, &GenerationConfig { max_tokens: 10, temperature: 0.3 });
        let b = completion_cache_key("m", "sys", &msgs, &GenerationConfig { max_tokens: 20, temperature: 0.3 });
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
