//! JSON-over-HTTP client with retry classification and capped backoff.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// Retry budget for one logical call to a matching service.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// No retries at all; one attempt per call.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Pause before retry number `retry` (0-based). A server-supplied
    /// `Retry-After` wins over the doubling schedule; both stay under `max_delay`.
    fn pause(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or_else(|| self.base_delay.saturating_mul(2u32.saturating_pow(retry)))
            .min(self.max_delay)
    }
}

/// Similarity, embedding and mail APIs shed load with 429/503; gateways time out with 502/504.
fn transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("gmr/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("building http client: {0}")]
    Client(String),
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonHttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl JsonHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| HttpError::Client(err.to_string()))?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// POST a JSON body and decode a JSON response, retrying transient failures.
    pub async fn post_json<B, R>(&self, url: &str, bearer: Option<&str>, body: &B) -> Result<R, HttpError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let resp = self.send_with_retry(url, bearer, body).await?;
        Ok(resp.json::<R>().await?)
    }

    /// POST a JSON body and discard the response body.
    pub async fn post_json_discard<B>(&self, url: &str, bearer: Option<&str>, body: &B) -> Result<StatusCode, HttpError>
    where
        B: Serialize + ?Sized,
    {
        let resp = self.send_with_retry(url, bearer, body).await?;
        Ok(resp.status())
    }

    async fn send_with_retry<B>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<reqwest::Response, HttpError>
    where
        B: Serialize + ?Sized,
    {
        let span = info_span!("http_post", url);
        async {
            let mut retry = 0u32;
            loop {
                let mut request = self.client.post(url).json(body);
                if let Some(token) = bearer {
                    request = request.bearer_auth(token);
                }

                let (failure, server_pause) = match request.send().await {
                    Ok(resp) if resp.status().is_success() => return Ok(resp),
                    Ok(resp) => {
                        let status = resp.status();
                        let failure = HttpError::Status {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        };
                        if !transient_status(status) {
                            return Err(failure);
                        }
                        (failure, retry_after(&resp))
                    }
                    Err(err) if transient_error(&err) => (HttpError::Request(err), None),
                    Err(err) => return Err(HttpError::Request(err)),
                };
                if retry >= self.backoff.max_retries {
                    return Err(failure);
                }
                let pause = self.backoff.pause(retry, server_pause);
                debug!(error = %failure, retry, pause_ms = pause.as_millis() as u64, "transient failure; retrying");
                tokio::time::sleep(pause).await;
                retry += 1;
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::*;

    /// Answers `failures` times with `status` (plus optional headers), then 200 `{"ok":true}`.
    async fn flaky_server(
        status: StatusCode,
        failures: usize,
        headers: HeaderMap,
    ) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/call",
                post(
                    move |State(hits): State<Arc<AtomicUsize>>| {
                        let headers = headers.clone();
                        async move {
                            let seen = hits.fetch_add(1, Ordering::SeqCst);
                            if seen < failures {
                                (status, headers, Json(json!({ "error": "busy" })))
                            } else {
                                (StatusCode::OK, HeaderMap::new(), Json(json!({ "ok": true })))
                            }
                        }
                    },
                ),
            )
            .with_state(hits.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/call"), hits)
    }

    fn client(max_retries: u32) -> JsonHttpClient {
        JsonHttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(20),
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn service_unavailable_is_retried_until_success() {
        let (url, hits) = flaky_server(StatusCode::SERVICE_UNAVAILABLE, 2, HeaderMap::new()).await;
        let value: Value = client(2).post_json(&url, Some("key"), &json!({})).await.unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_the_budget() {
        let (url, hits) = flaky_server(StatusCode::TOO_MANY_REQUESTS, 10, HeaderMap::new()).await;
        let err = client(1)
            .post_json_discard(&url, None, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_fail_on_first_attempt() {
        let (url, hits) = flaky_server(StatusCode::UNAUTHORIZED, 10, HeaderMap::new()).await;
        let err = client(3)
            .post_json_discard(&url, Some("wrong"), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_after_is_capped_by_max_delay() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "3600".parse().unwrap());
        let (url, hits) = flaky_server(StatusCode::SERVICE_UNAVAILABLE, 1, headers).await;
        let started = std::time::Instant::now();
        let status = client(1).post_json_discard(&url, None, &json!({})).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn connection_refused_surfaces_request_error() {
        let err = client(0)
            .post_json_discard("http://127.0.0.1:9/unreachable", None, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Request(_)));
        assert_eq!(err.status(), None);
    }
}
