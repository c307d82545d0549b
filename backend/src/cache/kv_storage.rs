use super::{CacheStorage, CachedResponse, DEFAULT_CACHE_TTL};
use crate::error::CacheError;
use crate::kv::KvStore;
use async_trait::async_trait;
use log::warn;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_KEY_PREFIX: &str = "etag:cache:";

/// Cache storage on a shared key-value store, for multi-process deployments.
/// Entries are stored as JSON and expire through the store's own TTL.
pub struct KvCacheStorage {
    store: Arc<dyn KvStore>,
    key_prefix: String,
    ttl: Duration,
}

impl KvCacheStorage {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        KvCacheStorage {
            store,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheStorage for KvCacheStorage {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let full_key = self.full_key(key);
        let Some(raw) = self.store.get(&full_key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(cached) => Ok(Some(cached)),
            Err(e) => {
                warn!("Dropping undecodable cache entry {full_key}: {e}");
                self.store.del(&full_key).await?;
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &CachedResponse,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let serialized = serde_json::to_string(value)?;
        self.store
            .set(&self.full_key(key), &serialized, Some(ttl.unwrap_or(self.ttl)))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.del(&self.full_key(key)).await?;
        Ok(())
    }
}
