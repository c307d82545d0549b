//! Composable fetch pipeline.
//!
//! A [`Fetch`] is an async function from [`FetchRequest`] to [`FetchResponse`].
//! A [`Middleware`] takes the next fetch in the chain and returns a new one with
//! the same signature. [`compose`] folds a list of middlewares over a base
//! transport so that the first middleware in the list is the outermost wrapper:
//! `compose(base, [a, b])` is `a(b(base))`.

pub mod cache;
pub mod retry;

use crate::error::FetchError;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{Future, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use url::Url;

pub use cache::{cache_middleware, with_cache, CacheOptions, CACHE_TTL_HEADER};
pub use retry::{retry_middleware, with_retry, RetryOptions};

pub type FetchFuture = BoxFuture<'static, Result<FetchResponse, FetchError>>;

pub type Fetch = Arc<dyn Fn(FetchRequest) -> FetchFuture + Send + Sync>;

pub type Middleware = Box<dyn FnOnce(Fetch) -> Fetch + Send>;

/// Wraps an async closure as a [`Fetch`].
pub fn fetch_fn<F, Fut>(f: F) -> Fetch
where
    F: Fn(FetchRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<FetchResponse, FetchError>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Applies `middlewares` right-to-left over `base`.
pub fn compose(base: Fetch, middlewares: Vec<Middleware>) -> Fetch {
    middlewares
        .into_iter()
        .rev()
        .fold(base, |next, middleware| middleware(next))
}

/// `url` without its query string, for logs and errors. Queries carry the API key.
pub fn redact_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

/// Base transport backed by a shared reqwest client.
pub fn reqwest_transport(client: reqwest::Client) -> Fetch {
    fetch_fn(move |request: FetchRequest| {
        let client = client.clone();
        async move {
            let response = client
                .request(request.method, request.url)
                .headers(request.headers)
                .send()
                .await?;
            Ok(FetchResponse::from_reqwest(response))
        }
    })
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl FetchRequest {
    pub fn new(method: Method, url: Url) -> Self {
        FetchRequest {
            method,
            url,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Result<Self, FetchError> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::InvalidRequest(format!("header {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

/// Response body as a single-pass byte stream.
pub struct Body {
    stream: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl Body {
    pub fn empty() -> Self {
        Body {
            stream: stream::empty().boxed(),
        }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes, FetchError>> + Send + 'static,
    {
        Body {
            stream: stream.boxed(),
        }
    }

    pub async fn bytes(self) -> Result<Bytes, FetchError> {
        let buffer = self
            .stream
            .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        Ok(buffer.freeze())
    }

    pub async fn text(self) -> Result<String, FetchError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| FetchError::Body(format!("not UTF-8: {e}")))
    }

    /// Reads the body to the end and discards it, releasing the connection.
    pub async fn drain(mut self) -> Result<(), FetchError> {
        while let Some(chunk) = self.stream.next().await {
            chunk?;
        }
        Ok(())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body {
            stream: stream::once(async move { Ok(bytes) }).boxed(),
        }
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::from(Bytes::from(text))
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::from(text.to_string())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Body { .. }")
    }
}

#[derive(Debug)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Body,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: impl Into<Body>) -> Self {
        FetchResponse {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let body = Body::from_stream(response.bytes_stream().map_err(FetchError::Transport));
        FetchResponse {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(name, value);
        }
        self
    }

    /// 2xx.
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub async fn text(self) -> Result<String, FetchError> {
        self.body.text().await
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, crate::error::ScraperError> {
        let bytes = self.body.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
