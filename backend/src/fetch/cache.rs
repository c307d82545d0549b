use super::{fetch_fn, redact_url, Body, Fetch, FetchRequest, FetchResponse, Middleware};
use crate::cache::{cache_key, CacheStorage, CachedResponse};
use crate::error::FetchError;
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ETAG, IF_NONE_MATCH};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// Request header overriding the entry TTL, in seconds. Not forwarded.
pub const CACHE_TTL_HEADER: &str = "x-cache-ttl";

#[derive(Clone)]
pub struct CacheOptions {
    pub storage: Arc<dyn CacheStorage>,
    /// Per-entry TTL. `None` uses the storage default.
    pub ttl: Option<Duration>,
}

impl CacheOptions {
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        CacheOptions { storage, ttl: None }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

pub fn cache_middleware(options: CacheOptions) -> Middleware {
    Box::new(move |next| with_cache(next, options))
}

/// ETag based conditional caching.
///
/// A stored validator is sent as `If-None-Match`; a 304 answer is replaced by
/// the stored response, so callers never see a bare 304. Successful responses
/// carrying an `ETag` and a UTF-8 body are stored, anything else passes
/// through untouched.
pub fn with_cache(next: Fetch, options: CacheOptions) -> Fetch {
    fetch_fn(move |request: FetchRequest| {
        let next = next.clone();
        let options = options.clone();
        async move { fetch_with_cache(&next, request, &options).await }
    })
}

async fn fetch_with_cache(
    next: &Fetch,
    mut request: FetchRequest,
    options: &CacheOptions,
) -> Result<FetchResponse, FetchError> {
    let ttl = request_ttl(&mut request).or(options.ttl);
    if request.method != Method::GET {
        return next(request).await;
    }

    let key = cache_key(&request.method, &request.url);
    let url = request.url.clone();
    let cached = options.storage.get(&key).await?;

    if let Some(cached) = &cached {
        if let Ok(etag) = HeaderValue::from_str(&cached.etag) {
            request.headers.insert(IF_NONE_MATCH, etag);
        }
    }

    let response = next(request).await?;

    if response.status == StatusCode::NOT_MODIFIED {
        if let Some(cached) = cached {
            debug!("Cache hit for {}", redact_url(&url));
            response.body.drain().await?;
            return response_from_cache(cached);
        }
        return Ok(response);
    }

    if !response.is_ok() {
        return Ok(response);
    }

    let Some(etag) = response.header_str(ETAG.as_str()).map(String::from) else {
        return Ok(response);
    };

    let FetchResponse {
        status,
        status_text,
        headers,
        body,
    } = response;
    let bytes = body.bytes().await?;
    let Ok(text) = std::str::from_utf8(&bytes) else {
        debug!("Not caching {}: body is not UTF-8", redact_url(&url));
        return Ok(FetchResponse {
            status,
            status_text,
            headers,
            body: Body::from(bytes),
        });
    };

    debug!("Cache miss for {}, storing etag {etag}", redact_url(&url));
    let entry = CachedResponse {
        body: text.to_string(),
        etag,
        headers: serialize_headers(&headers),
        status: status.as_u16(),
        status_text,
    };
    options.storage.set(&key, &entry, ttl).await?;

    Ok(FetchResponse {
        status,
        status_text: entry.status_text,
        headers,
        body: Body::from(bytes),
    })
}

/// Removes the TTL override header, returning its value when it parses.
fn request_ttl(request: &mut FetchRequest) -> Option<Duration> {
    let value = request.headers.remove(CACHE_TTL_HEADER)?;
    let seconds = value.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

fn serialize_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn deserialize_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

fn response_from_cache(cached: CachedResponse) -> Result<FetchResponse, FetchError> {
    let status = StatusCode::from_u16(cached.status)
        .map_err(|e| FetchError::InvalidRequest(format!("cached status {}: {e}", cached.status)))?;
    Ok(FetchResponse {
        status,
        status_text: cached.status_text,
        headers: deserialize_headers(&cached.headers),
        body: Body::from(cached.body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStorage;
    use crate::fetch::{compose, retry_middleware, RetryOptions};
    use crate::test_utils::StubTransport;
    use bytes::Bytes;
    use url::Url;

    const URL: &str = "https://api.example.com/data";
    const KEY: &str = "GET:https://api.example.com/data";

    fn request() -> FetchRequest {
        FetchRequest::get(Url::parse(URL).unwrap())
    }

    fn tagged(body: &str, etag: &str) -> FetchResponse {
        FetchResponse::new(StatusCode::OK, body)
            .with_header("content-type", "application/json")
            .with_header("etag", etag)
            .with_header("x-served-by", "cache-1")
            .with_header("x-served-by", "cache-2")
    }

    fn setup(
        responses: Vec<FetchResponse>,
    ) -> (Arc<StubTransport>, Arc<InMemoryCacheStorage>, Fetch) {
        let transport = StubTransport::sequence(responses);
        let storage = Arc::new(InMemoryCacheStorage::default());
        let fetch = with_cache(transport.fetch(), CacheOptions::new(storage.clone()));
        (transport, storage, fetch)
    }

    #[tokio::test]
    async fn stores_successful_responses_with_etag() {
        let (transport, storage, fetch) = setup(vec![tagged("{\"data\":\"test\"}", "\"abc123\"")]);

        let response = fetch(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "{\"data\":\"test\"}");
        assert_eq!(transport.call_count(), 1);

        let cached = storage.get(KEY).await.unwrap().unwrap();
        assert_eq!(cached.etag, "\"abc123\"");
        assert_eq!(cached.body, "{\"data\":\"test\"}");
        assert_eq!(cached.status, 200);
    }

    #[tokio::test]
    async fn not_modified_yields_the_originally_cached_response() {
        let (transport, _storage, fetch) = setup(vec![
            tagged("{\"data\":\"test\"}", "\"abc123\""),
            FetchResponse::new(StatusCode::NOT_MODIFIED, ""),
        ]);

        let first = fetch(request()).await.unwrap();
        let first_status = first.status;
        let first_status_text = first.status_text.clone();
        let first_headers = first.headers.clone();
        let first_body = first.text().await.unwrap();

        let second = fetch(request()).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].headers.get(IF_NONE_MATCH).is_none());
        assert_eq!(calls[1].headers.get(IF_NONE_MATCH).unwrap(), "\"abc123\"");

        assert_eq!(second.status, first_status);
        assert_eq!(second.status_text, first_status_text);
        assert_eq!(second.headers, first_headers);
        assert_eq!(second.text().await.unwrap(), first_body);
    }

    #[tokio::test]
    async fn fresh_response_replaces_the_cached_entry() {
        let (_transport, storage, fetch) = setup(vec![
            tagged("{\"data\":\"old\"}", "\"abc123\""),
            tagged("{\"data\":\"new\"}", "\"def456\""),
        ]);

        fetch(request()).await.unwrap();
        let second = fetch(request()).await.unwrap();
        assert_eq!(second.text().await.unwrap(), "{\"data\":\"new\"}");

        let cached = storage.get(KEY).await.unwrap().unwrap();
        assert_eq!(cached.etag, "\"def456\"");
        assert_eq!(cached.body, "{\"data\":\"new\"}");
    }

    #[tokio::test]
    async fn responses_without_etag_are_not_cached() {
        let (_transport, storage, fetch) =
            setup(vec![FetchResponse::new(StatusCode::OK, "{\"data\":\"test\"}")]);

        let response = fetch(request()).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "{\"data\":\"test\"}");
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn error_responses_pass_through_uncached() {
        let (_transport, storage, fetch) = setup(vec![FetchResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "boom",
        )
        .with_header("etag", "\"err\"")]);

        let response = fetch(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn non_utf8_bodies_pass_through_unaltered_and_uncached() {
        let raw: &'static [u8] = &[255, 254, 97];
        let (_transport, storage, fetch) = setup(vec![FetchResponse::new(
            StatusCode::OK,
            Bytes::from_static(raw),
        )
        .with_header("etag", "\"bin\"")]);

        let response = fetch(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body.bytes().await.unwrap().as_ref(), raw);
        assert!(storage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_header_overrides_the_entry_ttl_and_is_not_forwarded() {
        let (transport, storage, fetch) = setup(vec![tagged("{}", "\"abc123\"")]);
        let with_ttl = request()
            .header(HeaderName::from_static(CACHE_TTL_HEADER), "5")
            .unwrap();
        fetch(with_ttl).await.unwrap();

        assert!(transport.calls()[0].headers.get(CACHE_TTL_HEADER).is_none());
        assert!(storage.get(KEY).await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(storage.get(KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn non_get_requests_bypass_the_cache() {
        let (transport, storage, fetch) = setup(vec![tagged("{}", "\"abc123\"")]);
        let url = Url::parse(URL).unwrap();

        fetch(FetchRequest::new(Method::POST, url)).await.unwrap();
        assert_eq!(transport.call_count(), 1);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn different_query_strings_use_different_entries() {
        let (transport, storage, fetch) =
            setup(vec![tagged("page 1", "\"p1\""), tagged("page 2", "\"p2\"")]);

        fetch(FetchRequest::get(Url::parse("https://api.example.com/data?page=1").unwrap()))
            .await
            .unwrap();
        fetch(FetchRequest::get(Url::parse("https://api.example.com/data?page=2").unwrap()))
            .await
            .unwrap();

        assert!(transport.calls()[1].headers.get(IF_NONE_MATCH).is_none());
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn cache_wrapped_around_retry_sees_only_the_final_response() {
        let transport = StubTransport::sequence(vec![
            tagged("v1", "\"v1\""),
            FetchResponse::new(StatusCode::SERVICE_UNAVAILABLE, "busy"),
            FetchResponse::new(StatusCode::NOT_MODIFIED, ""),
        ]);
        let storage = Arc::new(InMemoryCacheStorage::default());
        let retry = RetryOptions {
            min_delay: Duration::ZERO,
            ..RetryOptions::default()
        };
        let fetch = compose(
            transport.fetch(),
            vec![
                cache_middleware(CacheOptions::new(storage.clone())),
                retry_middleware(retry),
            ],
        );

        fetch(request()).await.unwrap();
        let second = fetch(request()).await.unwrap();

        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.text().await.unwrap(), "v1");
        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].headers.get(IF_NONE_MATCH).unwrap(), "\"v1\"");
        assert_eq!(calls[2].headers.get(IF_NONE_MATCH).unwrap(), "\"v1\"");
    }
}
