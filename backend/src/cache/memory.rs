use super::{CacheStorage, CachedResponse, DEFAULT_CACHE_TTL};
use crate::error::{CacheError, KvError};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

struct CacheEntry {
    value: CachedResponse,
    expires_at: Instant,
}

/// Process-local cache storage bounded by TTL.
pub struct InMemoryCacheStorage {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl Default for InMemoryCacheStorage {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl InMemoryCacheStorage {
    pub fn new(ttl: Duration) -> Self {
        InMemoryCacheStorage {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CacheEntry>>, CacheError> {
        self.entries.lock().map_err(|_| {
            CacheError::Storage(KvError::Backend("cache lock poisoned".to_string()))
        })
    }
}

#[async_trait]
impl CacheStorage for InMemoryCacheStorage {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let mut entries = self.lock()?;
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) => Instant::now() >= entry.expires_at,
        };

        if expired {
            debug!("Evicting expired cache entry {key}");
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &CachedResponse,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl.unwrap_or(self.ttl);
        self.lock()?.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
