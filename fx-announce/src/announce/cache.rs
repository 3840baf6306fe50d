use crate::announce::Result;
use async_trait::async_trait;
use log::{debug, trace};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Retrieves the value of a key when it's not present within a [TtlCache].
#[async_trait]
pub trait Fetch<K, V>: Debug + Send + Sync {
    /// Fetch the current value of the given key.
    /// This might perform network I/O and should honor the given cancellation token.
    async fn fetch(&self, key: &K, cancel: &CancellationToken) -> Result<V>;
}

/// A keyed cache which drops its values once their time-to-live has elapsed.
///
/// Missing or expired values are retrieved through the [Fetch] implementation of the cache.
/// The fetch is executed without holding the cache lock, which means that concurrent misses of the
/// same key will each invoke the fetcher. Fetch failures are never stored.
#[derive(Debug)]
pub struct TtlCache<K, V, F> {
    ttl: Duration,
    fetcher: F,
    entries: Mutex<CacheEntries<K, V>>,
}

impl<K, V, F> TtlCache<K, V, F>
where
    K: Debug + Clone + Eq + Hash + Send + Sync,
    V: Debug + Clone + Send,
    F: Fetch<K, V>,
{
    /// Create a new cache which keeps fetched values for the given duration.
    pub fn new(ttl: Duration, fetcher: F) -> Self {
        Self {
            ttl,
            fetcher,
            entries: Mutex::new(CacheEntries::default()),
        }
    }

    /// Get the value of the given key.
    /// Expired entries are evicted before the lookup takes place.
    ///
    /// # Returns
    ///
    /// It returns the cached value when it's still alive, else the freshly fetched value.
    pub async fn get(&self, key: &K, cancel: &CancellationToken) -> Result<V> {
        {
            let mut entries = self.lock();
            entries.evict_expired(Instant::now());

            if let Some(value) = entries.get(key) {
                trace!("Cache hit for {:?}", key);
                return Ok(value);
            }
        }

        debug!("Cache miss for {:?}, fetching new value", key);
        let value = self.fetcher.fetch(key, cancel).await?;

        let mut entries = self.lock();
        entries.insert(key.clone(), value.clone(), Instant::now() + self.ttl);
        Ok(value)
    }

    /// Get the number of entries stored within the cache, including expired entries which haven't
    /// been evicted yet.
    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    /// Returns true when the cache doesn't contain any entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the fetcher of the cache.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    fn lock(&self) -> MutexGuard<'_, CacheEntries<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct CacheEntries<K, V> {
    values: HashMap<K, CacheEntry<V>>,
    expirations: BinaryHeap<Expiration<K>>,
}

impl<K, V> CacheEntries<K, V>
where
    K: Debug + Clone + Eq + Hash,
    V: Clone,
{
    fn get(&self, key: &K) -> Option<V> {
        self.values.get(key).map(|e| e.value.clone())
    }

    fn insert(&mut self, key: K, value: V, expires_at: Instant) {
        self.expirations.push(Expiration {
            expires_at,
            key: key.clone(),
        });
        self.values.insert(key, CacheEntry { value, expires_at });
    }

    /// Remove all entries which expired at or before the given instant.
    /// Only the expired front of the expiration queue is visited.
    fn evict_expired(&mut self, now: Instant) {
        while let Some(expiration) = self.expirations.peek() {
            if expiration.expires_at > now {
                break;
            }

            if let Some(expiration) = self.expirations.pop() {
                // the key might have been stored again with a later expiration
                let is_current = self
                    .values
                    .get(&expiration.key)
                    .filter(|e| e.expires_at == expiration.expires_at)
                    .is_some();

                if is_current {
                    trace!("Evicting expired cache entry {:?}", expiration.key);
                    self.values.remove(&expiration.key);
                }
            }
        }
    }
}

impl<K, V> Default for CacheEntries<K, V> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            expirations: BinaryHeap::new(),
        }
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// The expiration moment of a cache key.
/// The ordering is reversed so the [BinaryHeap] yields the soonest expiration first.
#[derive(Debug)]
struct Expiration<K> {
    expires_at: Instant,
    key: K,
}

impl<K> PartialEq for Expiration<K> {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}

impl<K> Eq for Expiration<K> {}

impl<K> PartialOrd for Expiration<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Expiration<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.expires_at.cmp(&self.expires_at)
    }
}
