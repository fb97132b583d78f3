use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug)]
struct Store<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Bumped by every invalidation. A load that started under an older
    /// generation must not be cached.
    generation: u64,
}

/// Small keyed cache with a fixed time-to-live and explicit invalidation.
#[derive(Debug, Clone)]
pub struct TtlCache<K, V> {
    store: Arc<RwLock<Store<K, V>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            store: Arc::new(RwLock::new(Store {
                entries: HashMap::new(),
                generation: 0,
            })),
            ttl,
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let store = self.store.read().await;
        store
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut store = self.store.write().await;
        self.put(&mut store, key, value);
    }

    fn put(&self, store: &mut Store<K, V>, key: K, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        store.entries.retain(|_, entry| !entry.is_expired());
        store.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Return the cached value or run `loader` and cache its result.
    /// Loader errors are returned as-is and nothing is cached.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.get_or_load_if(key, loader, |_| true).await
    }

    /// Like [`get_or_load`](Self::get_or_load), but a loaded value is only
    /// cached when `cacheable` accepts it and no invalidation happened while
    /// it was loading.
    pub async fn get_or_load_if<F, Fut, E, P>(
        &self,
        key: K,
        loader: F,
        cacheable: P,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        P: FnOnce(&V) -> bool,
    {
        let generation = {
            let store = self.store.read().await;
            if let Some(entry) = store.entries.get(&key).filter(|e| !e.is_expired()) {
                return Ok(entry.value.clone());
            }
            store.generation
        };

        let value = loader().await?;
        if cacheable(&value) {
            let mut store = self.store.write().await;
            if store.generation == generation {
                self.put(&mut store, key, value.clone());
            }
        }
        Ok(value)
    }

    pub async fn invalidate(&self, key: &K) {
        let mut store = self.store.write().await;
        store.generation += 1;
        store.entries.remove(key);
    }

    pub async fn clear(&self) {
        let mut store = self.store.write().await;
        store.generation += 1;
        store.entries.clear();
    }
}
