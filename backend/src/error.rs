use thiserror::Error;

/// Errors raised by the shared key-value store.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value backend error: {0}")]
    Backend(String),
    #[error("key-value transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("key-value response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] KvError),
    #[error("cache entry could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors surfaced by a fetch chain.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request to {url} failed: {status} {status_text}")]
    Status {
        status: u16,
        status_text: String,
        url: String,
    },
    /// 404 from the remote side. Never retried.
    #[error("resource not found: {url}")]
    NotFound { url: String },
    #[error("response body could not be read: {0}")]
    Body(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether the retry middleware may attempt the request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transport(_) | FetchError::Status { .. } | FetchError::Body(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("an API key is required")]
    ApiKey,
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("playlist not found: {0}")]
    PlaylistNotFound(String),
    #[error("video not found: {0}")]
    VideoNotFound(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("callback failed: {0}")]
    Callback(#[source] anyhow::Error),
    #[error("scrape cancelled")]
    Cancelled,
}

impl ScraperError {
    /// Not-found errors are terminal for one record, not for the whole run.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ScraperError::ChannelNotFound(_)
                | ScraperError::PlaylistNotFound(_)
                | ScraperError::VideoNotFound(_)
        )
    }
}
