//! Storage for responses kept by the conditional-cache middleware.

mod kv_storage;
mod memory;

pub use kv_storage::KvCacheStorage;
pub use memory::InMemoryCacheStorage;

use crate::error::CacheError;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// A response as originally received, plus the validator it was served with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub body: String,
    pub etag: String,
    /// Header name/value pairs in received order.
    pub headers: Vec<(String, String)>,
    pub status: u16,
    pub status_text: String,
}

#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Expired entries are reported as absent.
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError>;

    /// `ttl` of `None` falls back to the storage's default TTL.
    async fn set(
        &self,
        key: &str,
        value: &CachedResponse,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

pub fn cache_key(method: &Method, url: &Url) -> String {
    format!("{}:{}", method.as_str(), url.as_str())
}
