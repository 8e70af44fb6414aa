//! Bounded in-process cache with least-recently-used eviction and optional per-entry expiry.
//!
//! Used to memoize hot lookups that tolerate a few seconds of staleness.

use lru::LruCache;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

pub const DEFAULT_CAPACITY: usize = 1024;

type CacheCondition<V> = Box<dyn Fn(&V) -> bool + Send + Sync>;

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

pub struct TtlCache<K, V> {
    name: &'static str,
    entries: Mutex<LruCache<K, Entry<V>>>,
    ttl: Option<Duration>,
    condition: Option<CacheCondition<V>>,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: None,
            condition: None,
        }
    }

    /// Entries expire this long after insertion.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Only values for which `condition` returns true are stored.
    pub fn with_condition(mut self, condition: impl Fn(&V) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Box::new(condition));
        self
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries();
        let hit = entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.value.clone()));

        match hit {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        if let Some(condition) = &self.condition {
            if !condition(&value) {
                return;
            }
        }

        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        self.entries().put(key, Entry { value, expires_at });
    }

    pub fn invalidate(&self, key: &K) {
        self.entries().pop(key);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached value for `key`, or run `load` and cache its result.
    ///
    /// Errors are passed through and never cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            trace!(cache = self.name, "cache hit");
            return Ok(value);
        }

        trace!(cache = self.name, "cache miss");
        let value = load().await?;
        self.insert(key, value.clone());
        Ok(value)
    }
}
