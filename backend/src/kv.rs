//! Shared key-value store used for cached responses and rate-limit counters.

use crate::error::KvError;
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;

    /// Atomically increments the counter at `key` and returns the new value.
    /// The expiry is set only when the increment creates the counter.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Process-local store. Suitable for tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>, KvError> {
        self.entries
            .lock()
            .map_err(|_| KvError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.lock()?.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        let current = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some((
                entry
                    .value
                    .parse::<i64>()
                    .map_err(|e| KvError::Backend(format!("{key} is not a counter: {e}")))?,
                entry.expires_at,
            )),
            _ => None,
        };

        let (count, expires_at) = match current {
            Some((count, expires_at)) => (count + 1, expires_at),
            None => (1, Some(now + ttl)),
        };

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: count.to_string(),
                expires_at,
            },
        );
        Ok(count)
    }
}

const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if current == 1 then
  redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return current
"#;

/// Redis reached over an HTTP command endpoint (Upstash REST protocol).
///
/// Each command is POSTed as a JSON array to the base URL with a bearer token,
/// and answered with `{"result": ...}` or `{"error": "..."}`.
pub struct RedisRestStore {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl RedisRestStore {
    pub fn new(client: reqwest::Client, url: impl Into<String>, token: impl Into<String>) -> Self {
        RedisRestStore {
            client,
            url: url.into(),
            token: token.into(),
        }
    }

    async fn command(&self, command: Value) -> Result<Value, KvError> {
        debug!("Redis command: {}", command[0]);
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await?;
        parse_command_response(status.as_u16(), body)
    }
}

fn ttl_millis(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

fn set_command(key: &str, value: &str, ttl: Option<Duration>) -> Value {
    match ttl {
        Some(ttl) => json!(["SET", key, value, "PX", ttl_millis(ttl)]),
        None => json!(["SET", key, value]),
    }
}

/// INCR plus a create-only PEXPIRE, evaluated atomically.
fn incr_with_expiry_command(key: &str, ttl: Duration) -> Value {
    json!(["EVAL", INCR_WITH_EXPIRY_SCRIPT, "1", key, ttl_millis(ttl)])
}

fn parse_command_response(status: u16, body: Value) -> Result<Value, KvError> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        return Err(KvError::Backend(error.to_string()));
    }
    if !(200..300).contains(&status) {
        return Err(KvError::Backend(format!("redis endpoint returned {status}")));
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}

#[async_trait]
impl KvStore for RedisRestStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let result = self.command(json!(["GET", key])).await?;
        Ok(result.as_str().map(String::from))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.command(set_command(key, value, ttl)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.command(json!(["DEL", key])).await?;
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let result = self.command(incr_with_expiry_command(key, ttl)).await?;
        result
            .as_i64()
            .ok_or_else(|| KvError::Backend(format!("unexpected EVAL result: {result}")))
    }
}
