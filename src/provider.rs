//! Calls to the external text-to-image provider.
//!
//! [`HttpProvider`] speaks both contracts seen in the wild: a synchronous POST
//! that answers with the image, and a job submission that answers with a
//! descriptor to poll. Which one is used comes from configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use base64::Engine;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ProviderConfig, ProviderMode};
use crate::media::{redact_base64, truncate_for_log};
use crate::models::{GenerationRequest, ImageRef};
use crate::normalizer::{extract_from_value, extract_images, NormalizationError, RawResponse};

const ERROR_BODY_LOG_LIMIT: usize = 800;
const POLL_URL_FIELDS: [&str; 3] = ["status_url", "polling_url", "poll_url"];

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0}")]
    Configuration(String),
    #[error("image provider answered HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("image generation timed out: {0}")]
    Timeout(String),
    #[error("could not reach image provider: {0}")]
    Connectivity(String),
    #[error("image provider job failed: {0}")]
    JobFailed(String),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
}

impl GenerationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) | Self::JobFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Connectivity(_) | Self::Normalization(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Connectivity(err.to_string())
        }
    }
}

/// One way of turning a prompt into images.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<ImageRef>, GenerationError>;
}

/// Injectable delay so polling and backoff can be simulated in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub connect_retries: u32,
    pub backoff: Duration,
}

/// Lifecycle of an asynchronous provider job.
#[derive(Debug)]
enum JobState {
    Submitted { poll_url: Url },
    Polling { poll_url: Url, attempt: u32 },
    Completed(Vec<ImageRef>),
    Failed(String),
    TimedOut { attempts: u32 },
}

#[derive(Debug, PartialEq)]
enum JobStatus {
    Pending,
    Completed,
    Failed(String),
}

impl JobStatus {
    fn from_body(body: &Value) -> Self {
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        match status.as_str() {
            "completed" | "succeeded" | "success" => JobStatus::Completed,
            "failed" | "error" | "canceled" | "cancelled" => {
                let reason = body
                    .get("error")
                    .map(|e| match e {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .filter(|s| !s.is_empty() && s != "null")
                    .unwrap_or_else(|| format!("status {status}"));
                JobStatus::Failed(reason)
            }
            _ => JobStatus::Pending,
        }
    }
}

pub struct HttpProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    model: Option<String>,
    mode: ProviderMode,
    poll: PollSettings,
    retry: RetrySettings,
    request_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpProvider {
    pub fn new(client: Client, endpoint: String, api_key: String, config: &ProviderConfig) -> Self {
        Self {
            client,
            endpoint,
            api_key,
            model: config.model.clone(),
            mode: config.mode,
            poll: PollSettings {
                interval: config.poll_interval,
                max_attempts: config.max_poll_attempts,
            },
            retry: RetrySettings {
                connect_retries: config.connect_retries,
                backoff: config.retry_backoff,
            },
            request_timeout: config.request_timeout,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// One adapter per configured endpoint, in order. Empty without an API key.
    pub fn from_config(client: &Client, config: &ProviderConfig) -> Vec<Arc<dyn ProviderAdapter>> {
        let Some(api_key) = config.api_key.clone() else {
            return Vec::new();
        };
        config
            .endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(HttpProvider::new(client.clone(), endpoint.clone(), api_key.clone(), config))
                    as Arc<dyn ProviderAdapter>
            })
            .collect()
    }

    fn payload(&self, request: &GenerationRequest) -> Value {
        let mut body = json!({
            "prompt": request.prompt,
            "num_outputs": 1,
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        if let Some(image) = &request.source_image {
            body["image"] = json!(base64::engine::general_purpose::STANDARD.encode(image));
        }
        if let Some(strength) = request.strength {
            body["strength"] = json!(strength);
        }
        body
    }

    /// Sends a request, retrying only connection-level failures.
    async fn send_with_retry<F>(&self, build: F) -> Result<RawResponse, GenerationError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        let response = loop {
            match build().send().await {
                Ok(response) => break response,
                Err(err) if err.is_connect() && attempt < self.retry.connect_retries => {
                    attempt += 1;
                    warn!(
                        "🔁 Connection to {} failed ({}), retry {}/{}",
                        self.endpoint, err, attempt, self.retry.connect_retries
                    );
                    self.sleeper.sleep(self.retry.backoff).await;
                }
                Err(err) => {
                    error!("❌ Request to {} failed: {}", self.endpoint, err);
                    return Err(GenerationError::from_transport(err));
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("❌ Provider error {}: {}", status, truncate_for_log(&body, ERROR_BODY_LOG_LIMIT));
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                body: truncate_for_log(&body, ERROR_BODY_LOG_LIMIT),
            });
        }

        let raw = RawResponse::read(response).await.map_err(GenerationError::from_transport)?;
        log_response(&raw);
        Ok(raw)
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<RawResponse, GenerationError> {
        let payload = self.payload(request);
        info!("🔗 Submitting generation to {} ({} chars of prompt)", self.endpoint, request.prompt.len());
        self.send_with_retry(|| {
            self.client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .timeout(self.request_timeout)
                .json(&payload)
        })
        .await
    }

    async fn fetch_status(&self, poll_url: &Url) -> Result<Value, GenerationError> {
        let raw = self
            .send_with_retry(|| {
                self.client
                    .get(poll_url.clone())
                    .bearer_auth(&self.api_key)
                    .timeout(self.request_timeout)
            })
            .await?;
        Ok(raw.to_json()?)
    }

    /// Reads the poll URL out of a job descriptor.
    fn poll_url(&self, descriptor: &Value) -> Option<Url> {
        let candidate = descriptor
            .pointer("/urls/get")
            .and_then(Value::as_str)
            .or_else(|| {
                POLL_URL_FIELDS
                    .iter()
                    .find_map(|field| descriptor.get(*field).and_then(Value::as_str))
            })?;
        let base = Url::parse(&self.endpoint).ok();
        match Url::parse(candidate) {
            Ok(url) => Some(url),
            Err(_) => base.and_then(|b| b.join(candidate).ok()),
        }
    }

    /// Hard ceiling for a polled job.
    fn poll_budget(&self) -> Duration {
        self.poll
            .interval
            .checked_mul(self.poll.max_attempts)
            .and_then(|polls| polls.checked_add(self.request_timeout))
            .unwrap_or(Duration::MAX)
    }

    async fn run_job(&self, poll_url: Url) -> Result<Vec<ImageRef>, GenerationError> {
        let mut state = JobState::Submitted { poll_url };
        loop {
            state = match state {
                JobState::Submitted { poll_url } => {
                    info!("⏳ Job submitted, polling {}", poll_url);
                    JobState::Polling { poll_url, attempt: 0 }
                }
                JobState::Polling { attempt, .. } if attempt >= self.poll.max_attempts => {
                    JobState::TimedOut { attempts: attempt }
                }
                JobState::Polling { poll_url, attempt } => {
                    self.sleeper.sleep(self.poll.interval).await;
                    let body = self.fetch_status(&poll_url).await?;
                    match JobStatus::from_body(&body) {
                        JobStatus::Completed => JobState::Completed(extract_from_value(&body)?),
                        JobStatus::Failed(reason) => JobState::Failed(reason),
                        JobStatus::Pending => {
                            debug!("Job still running (attempt {})", attempt + 1);
                            JobState::Polling { poll_url, attempt: attempt + 1 }
                        }
                    }
                }
                JobState::Completed(images) => {
                    info!("✅ Job completed with {} image(s)", images.len());
                    return Ok(images);
                }
                JobState::Failed(reason) => {
                    error!("❌ Job failed: {}", reason);
                    return Err(GenerationError::JobFailed(reason));
                }
                JobState::TimedOut { attempts } => {
                    warn!("⌛ Job still pending after {} polls", attempts);
                    return Err(GenerationError::Timeout(format!(
                        "job not finished after {attempts} polls"
                    )));
                }
            };
        }
    }

    async fn generate_polled(&self, submission: RawResponse) -> Result<Vec<ImageRef>, GenerationError> {
        if submission.is_image() {
            return Ok(extract_images(&submission)?);
        }
        let descriptor = submission.to_json()?;
        match JobStatus::from_body(&descriptor) {
            JobStatus::Completed => return Ok(extract_from_value(&descriptor)?),
            JobStatus::Failed(reason) => return Err(GenerationError::JobFailed(reason)),
            JobStatus::Pending => {}
        }
        let Some(poll_url) = self.poll_url(&descriptor) else {
            // some deployments answer synchronously even in poll mode
            return Ok(extract_from_value(&descriptor)?);
        };

        let budget = self.poll_budget();
        tokio::time::timeout(budget, self.run_job(poll_url))
            .await
            .map_err(|_| GenerationError::Timeout(format!("polling exceeded {}s", budget.as_secs())))?
    }
}

fn log_response(raw: &RawResponse) {
    if raw.is_image() {
        debug!("📥 Provider answered with {} bytes of image data", raw.body.len());
        return;
    }
    match raw.to_json() {
        Ok(mut value) => {
            redact_base64(&mut value);
            debug!("📥 Provider response: {}", truncate_for_log(&value.to_string(), 1000));
        }
        Err(_) => debug!(
            "📥 Provider response ({:?}): {}",
            raw.content_type,
            truncate_for_log(&String::from_utf8_lossy(&raw.body), 300)
        ),
    }
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<ImageRef>, GenerationError> {
        let submission = self.submit(request).await?;
        match self.mode {
            ProviderMode::Sync => Ok(extract_images(&submission)?),
            ProviderMode::Poll => self.generate_polled(submission).await,
        }
    }
}
