use super::{fetch_fn, redact_url, Fetch, FetchRequest, FetchResponse, Middleware};
use crate::error::FetchError;
use log::{debug, warn};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fail immediately with [`FetchError::NotFound`] on a 404.
    pub abort_on_not_found: bool,
    pub min_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            max_attempts: 5,
            abort_on_not_found: true,
            min_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryOptions {
    /// Delay after the `attempt`-th failure (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.max(1).saturating_pow(attempt.saturating_sub(1));
        self.min_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

pub fn retry_middleware(options: RetryOptions) -> Middleware {
    Box::new(move |next| with_retry(next, options))
}

/// Retries transient failures of `next` with exponential backoff.
///
/// 2xx and 304 responses are returned as-is. Any other response has its body
/// drained before it is turned into an error, so the connection can go back
/// to the pool.
pub fn with_retry(next: Fetch, options: RetryOptions) -> Fetch {
    let options = Arc::new(options);
    fetch_fn(move |request: FetchRequest| {
        let next = next.clone();
        let options = options.clone();
        async move { fetch_with_retry(&next, request, &options).await }
    })
}

async fn fetch_with_retry(
    next: &Fetch,
    request: FetchRequest,
    options: &RetryOptions,
) -> Result<FetchResponse, FetchError> {
    let max_attempts = options.max_attempts.max(1);
    let url = redact_url(&request.url);
    let mut attempt = 1;

    loop {
        match try_once(next, request.clone(), options).await {
            Ok(response) => return Ok(response),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                warn!(
                    "Giving up on {} after {} attempts: {}",
                    url, attempt, e
                );
                return Err(e);
            }
            Err(e) => {
                let delay = options.backoff(attempt);
                warn!(
                    "Request to {} failed ({}), retrying in {:?} (attempt {}/{})",
                    url, e, delay, attempt, max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn try_once(
    next: &Fetch,
    request: FetchRequest,
    options: &RetryOptions,
) -> Result<FetchResponse, FetchError> {
    let url = redact_url(&request.url);
    let response = next(request).await?;

    if response.is_ok() || response.status == StatusCode::NOT_MODIFIED {
        return Ok(response);
    }

    let status = response.status;
    let status_text = response.status_text.clone();
    response.body.drain().await?;
    debug!("Drained {} response body from {}", status.as_u16(), url);

    if options.abort_on_not_found && status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound { url });
    }

    Err(FetchError::Status {
        status: status.as_u16(),
        status_text,
        url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::Body;
    use crate::test_utils::StubTransport;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use url::Url;

    fn request() -> FetchRequest {
        FetchRequest::get(Url::parse("https://api.example.com/data").unwrap())
    }

    fn error_response() -> FetchResponse {
        FetchResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "error")
    }

    #[tokio::test]
    async fn returns_successful_response_without_retrying() {
        let transport = StubTransport::sequence(vec![FetchResponse::new(StatusCode::OK, "success")]);
        let fetch = with_retry(transport.fetch(), RetryOptions::default());

        let response = fetch(request()).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "success");
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn does_not_retry_not_modified() {
        let transport =
            StubTransport::sequence(vec![FetchResponse::new(StatusCode::NOT_MODIFIED, "")]);
        let fetch = with_retry(transport.fetch(), RetryOptions::default());

        let response = fetch(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn four_failures_then_success_within_default_budget() {
        let transport = StubTransport::sequence(vec![
            error_response(),
            error_response(),
            FetchResponse::new(StatusCode::BAD_GATEWAY, "bad gateway"),
            FetchResponse::new(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            FetchResponse::new(StatusCode::OK, "success"),
        ]);
        let fetch = with_retry(transport.fetch(), RetryOptions::default());

        let response = fetch(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "success");
        assert_eq!(transport.call_count(), 5);
    }

    #[tokio::test]
    async fn not_found_aborts_after_one_call() {
        let transport = StubTransport::sequence(vec![
            FetchResponse::new(StatusCode::NOT_FOUND, "not found"),
            FetchResponse::new(StatusCode::OK, "never reached"),
        ]);
        let fetch = with_retry(transport.fetch(), RetryOptions::default());

        let err = fetch(request()).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
        assert!(!err.is_retryable());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_retried_when_abort_is_disabled() {
        let transport = StubTransport::sequence(vec![
            FetchResponse::new(StatusCode::NOT_FOUND, "not found"),
            FetchResponse::new(StatusCode::NOT_FOUND, "not found"),
            FetchResponse::new(StatusCode::OK, "success"),
        ]);
        let options = RetryOptions {
            abort_on_not_found: false,
            ..RetryOptions::default()
        };
        let fetch = with_retry(transport.fetch(), options);

        let response = fetch(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_last_error_when_attempts_are_exhausted() {
        let transport = StubTransport::new(|_request, _call| Ok(error_response()));
        let options = RetryOptions {
            max_attempts: 3,
            ..RetryOptions::default()
        };
        let fetch = with_retry(transport.fetch(), options);

        let err = fetch(request()).await.unwrap_err();
        match err {
            FetchError::Status {
                status,
                status_text,
                ..
            } => {
                assert_eq!(status, 500);
                assert_eq!(status_text, "Internal Server Error");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_level_failures() {
        let transport = StubTransport::new(|_request, call| {
            if call == 0 {
                Err(FetchError::Body("connection reset".to_string()))
            } else {
                Ok(FetchResponse::new(StatusCode::OK, "success"))
            }
        });
        let fetch = with_retry(transport.fetch(), RetryOptions::default());

        let response = fetch(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_failed_response_body() {
        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        let transport = StubTransport::new(move |_request, call| {
            if call > 0 {
                return Ok(FetchResponse::new(StatusCode::OK, "success"));
            }
            let flag = flag.clone();
            let chunks = futures::stream::iter(vec![
                Ok(Bytes::from("part one")),
                Ok(Bytes::from("part two")),
            ])
            .chain(futures::stream::once(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(Bytes::new())
            }));
            let mut response = error_response();
            response.body = Body::from_stream(chunks);
            Ok(response)
        });
        let fetch = with_retry(transport.fetch(), RetryOptions::default());

        fetch(request()).await.unwrap();
        assert!(drained.load(Ordering::SeqCst));
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let options = RetryOptions::default();
        assert_eq!(options.backoff(1), Duration::from_secs(1));
        assert_eq!(options.backoff(2), Duration::from_secs(2));
        assert_eq!(options.backoff(4), Duration::from_secs(8));
        assert_eq!(options.backoff(10), Duration::from_secs(30));
    }
}
