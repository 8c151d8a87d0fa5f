//! Rate-limited HTTP client. Reads are retried with capped exponential backoff; writes are sent once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

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
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("http client is shutting down")]
    Closed,
    #[error("retries exhausted for {0}")]
    RetriesExhausted(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn permits(&self, source_id: &str) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), FetchError> {
        let global = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        let source = self
            .per_source_semaphore(source_id)
            .await
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        Ok((global, source))
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get(run_id, source_id, url, &[]).await
    }

    /// Idempotent read with retries on 5xx/429 and transport failures.
    pub async fn get(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permits = self.permits(source_id).await?;
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            for attempt in 0..=self.backoff.max_retries {
                let mut request = self.client.get(url);
                for (name, value) in headers {
                    request = request.header(*name, *value);
                }

                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(status = status.as_u16(), attempt, "retrying read");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        let body = resp.text().await.unwrap_or_default();
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            body,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %err, attempt, "retrying read");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
            Err(FetchError::RetriesExhausted(url.to_string()))
        }
        .instrument(span)
        .await
    }

    /// Single-attempt JSON POST. Non-2xx responses come back as `HttpStatus` with the body kept.
    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &serde_json::Value,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permits = self.permits(source_id).await?;
        let span = info_span!("http_write", %run_id, source_id, url);
        async {
            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let bytes = resp.bytes().await?.to_vec();
            if status.is_success() {
                Ok(FetchedResponse {
                    status,
                    final_url,
                    body: bytes,
                })
            } else {
                Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                })
            }
        }
        .instrument(span)
        .await
    }
}
