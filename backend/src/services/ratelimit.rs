//! Fixed-window admission control for ingestion jobs.
//!
//! Counters live in the shared [`KvStore`], so the window holds across every
//! process using the same store. The window starts with the first acquisition
//! and ends when the counter expires.

use crate::error::KvError;
use crate::kv::KvStore;
use log::{debug, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const KEY_PREFIX: &str = "ratelimit:";

/// Ingestion jobs, each admitted through its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    ChannelsUpdate,
    VideosUpdate,
    VideosCheck,
    VideosCheckRecent,
    VideosCheckAll,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::ChannelsUpdate,
        JobKind::VideosUpdate,
        JobKind::VideosCheck,
        JobKind::VideosCheckRecent,
        JobKind::VideosCheckAll,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            JobKind::ChannelsUpdate => "channels:update",
            JobKind::VideosUpdate => "videos:update",
            JobKind::VideosCheck => "videos:check",
            JobKind::VideosCheckRecent => "videos:check:recent",
            JobKind::VideosCheckAll => "videos:check:all",
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            JobKind::ChannelsUpdate => Duration::from_secs(30 * 60),
            JobKind::VideosUpdate => Duration::from_secs(5 * 60),
            JobKind::VideosCheck => Duration::from_secs(30),
            JobKind::VideosCheckRecent => Duration::from_secs(10 * 60),
            JobKind::VideosCheckAll => Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitOutcome {
    pub success: bool,
    pub limit: u32,
    pub remaining: u32,
}

pub struct FixedWindowRateLimiter {
    store: Arc<dyn KvStore>,
    max_count: u32,
    window: Duration,
    prefix: String,
    analytics: bool,
}

impl FixedWindowRateLimiter {
    pub fn new(store: Arc<dyn KvStore>, max_count: u32, window: Duration) -> Self {
        FixedWindowRateLimiter {
            store,
            max_count,
            window,
            prefix: KEY_PREFIX.to_string(),
            analytics: false,
        }
    }

    /// One run per window for `job`.
    pub fn for_job(store: Arc<dyn KvStore>, job: JobKind) -> Self {
        Self::new(store, 1, job.window())
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Log every rejection with its window parameters.
    pub fn with_analytics(mut self, analytics: bool) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn limit(&self, key: &str) -> Result<RateLimitOutcome, KvError> {
        let full_key = format!("{}{}", self.prefix, key);
        let count = self.store.incr_with_expiry(&full_key, self.window).await?;
        let success = count <= i64::from(self.max_count);
        let remaining = (i64::from(self.max_count) - count).max(0) as u32;

        if success {
            debug!("Admitted {key} ({remaining} remaining)");
        } else if self.analytics {
            warn!(
                "Rate limited {key}: {count} attempts, limit {} per {:?}",
                self.max_count, self.window
            );
        } else {
            warn!("Rate limited {key}");
        }

        Ok(RateLimitOutcome {
            success,
            limit: self.max_count,
            remaining,
        })
    }
}
