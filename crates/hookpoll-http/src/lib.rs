//! Shared HTTP client with concurrency limits, rate limiting and retry for hookpoll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, Instrument};

pub const CRATE_NAME: &str = "hookpoll-http";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Process-wide request pacing. `None` sends as fast as the limits allow.
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_scope_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Up to `burst` requests back to back, then one more per `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub refill_every: Duration,
}

/// Token-bucket pacing shared by every request the client sends.
#[derive(Debug)]
pub struct RequestPacer {
    limit: RateLimit,
    state: Mutex<PacerState>,
}

#[derive(Debug)]
struct PacerState {
    available: u32,
    refilled_at: Instant,
}

impl RequestPacer {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            burst: limit.burst.max(1),
            ..limit
        };
        Self {
            limit,
            state: Mutex::new(PacerState {
                available: limit.burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take a permit now, or learn how long until the next one is earned.
    pub async fn try_take(&self) -> Result<(), Duration> {
        let interval = self.limit.refill_every;
        if interval.is_zero() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let earned = (state.refilled_at.elapsed().as_nanos() / interval.as_nanos())
            .min(u128::from(self.limit.burst)) as u32;
        if earned > 0 {
            state.available = state.available.saturating_add(earned).min(self.limit.burst);
            if state.available == self.limit.burst {
                state.refilled_at = Instant::now();
            } else {
                // Keep the partial interval already elapsed.
                state.refilled_at += interval.saturating_mul(earned);
            }
        }

        if state.available > 0 {
            state.available -= 1;
            Ok(())
        } else {
            Err(interval.saturating_sub(state.refilled_at.elapsed()))
        }
    }

    pub async fn acquire(&self) {
        while let Err(wait) = self.try_take().await {
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("http client is shutting down")]
    Closed,
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            HttpError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Client shared by every source and sink in the process.
///
/// Requests are tagged with a scope (typically a polling target id) so one
/// busy target cannot take every connection slot.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            pacer: config.rate_limit.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    /// Scope semaphores nobody holds are dropped here, so the map only
    /// tracks scopes with a request in flight.
    async fn per_scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.retain(|_, sem| Arc::strong_count(sem) > 1);
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    pub async fn active_scopes(&self) -> usize {
        let mut map = self.per_scope.lock().await;
        map.retain(|_, sem| Arc::strong_count(sem) > 1);
        map.len()
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        scope: &str,
        url: &str,
        headers: HeaderMap,
    ) -> Result<T, HttpError> {
        let response = self.execute(scope, Method::GET, url, headers, None).await?;
        serde_json::from_slice(&response.body).map_err(|source| HttpError::Decode {
            url: response.final_url,
            source,
        })
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        scope: &str,
        url: &str,
        headers: HeaderMap,
        body: &B,
    ) -> Result<HttpResponse, HttpError> {
        let bytes = serde_json::to_vec(body).map_err(HttpError::Encode)?;
        self.execute(scope, Method::POST, url, headers, Some(bytes))
            .await
    }

    /// Send with retry on 5xx/429 and transient transport errors.
    ///
    /// Non-success statuses that are not retryable, or that remain after the
    /// last retry, surface as [`HttpError::HttpStatus`].
    pub async fn execute(
        &self,
        scope: &str,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, HttpError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::Closed)?;
        let per_scope = self.per_scope_semaphore(scope).await;
        let _scope = per_scope.acquire().await.map_err(|_| HttpError::Closed)?;

        if let Some(pacer) = &self.pacer {
            pacer.acquire().await;
        }

        let span = tracing::info_span!("http_request", scope, %method, url);
        self.send_with_retry(method, url, headers, body)
            .instrument(span)
            .await
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, HttpError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone());
            if let Some(bytes) = &body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(bytes.clone());
            }

            let can_retry = attempt < self.backoff.max_retries;
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(HttpResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }
}
