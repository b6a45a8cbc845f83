use std::time::{Duration, Instant};

use anyhow::Context;
use prodimp_core::{DeliveryAttempt, WebhookPayload};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
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
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookClientConfig {
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for WebhookClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl DeliveryError {
    /// Any non-2xx answer is worth another attempt; transport errors follow
    /// [`classify_reqwest_error`].
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            DeliveryError::Request(err) => classify_reqwest_error(err),
            DeliveryError::HttpStatus { .. } => RetryDisposition::Retryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Abandoned { last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub target_url: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
}

impl DeliveryReport {
    pub fn delivered(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Delivered,
    HttpError,
    Timeout,
    ConnectionError,
    InvalidRequest,
}

/// Result of the one-shot "test this webhook" POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub url: String,
    pub success: bool,
    pub outcome: ProbeOutcome,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: WebhookClientConfig,
}

impl WebhookClient {
    pub fn new(config: WebhookClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.config.backoff
    }

    async fn post_once(
        &self,
        url: &str,
        payload: &WebhookPayload,
        timeout: Duration,
    ) -> Result<StatusCode, DeliveryError> {
        let resp = self
            .client
            .post(url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(status)
        } else {
            Err(DeliveryError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            })
        }
    }

    /// Runs one subscriber's retry state machine to completion.
    ///
    /// Attempts stop at the first 2xx, at a non-retryable error, or once
    /// `max_attempts` is reached; the outcome is only logged and returned.
    pub async fn deliver(&self, attempt: DeliveryAttempt) -> DeliveryReport {
        let span = info_span!("webhook_delivery", url = %attempt.target_url, event = %attempt.payload.event);
        self.deliver_inner(attempt).instrument(span).await
    }

    async fn deliver_inner(&self, mut attempt: DeliveryAttempt) -> DeliveryReport {
        let policy = self.config.backoff;
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        while attempt.attempt_count < max_attempts {
            attempt.attempt_count += 1;
            match self
                .post_once(&attempt.target_url, &attempt.payload, self.config.timeout)
                .await
            {
                Ok(status) => {
                    info!(attempt = attempt.attempt_count, status = status.as_u16(), "webhook delivered");
                    return DeliveryReport {
                        target_url: attempt.target_url,
                        attempts: attempt.attempt_count,
                        outcome: DeliveryOutcome::Delivered {
                            status: status.as_u16(),
                        },
                    };
                }
                Err(err) => {
                    let disposition = err.disposition();
                    warn!(attempt = attempt.attempt_count, error = %err, ?disposition, "webhook attempt failed");
                    last_error = err.to_string();
                    if disposition == RetryDisposition::NonRetryable {
                        break;
                    }
                    if attempt.attempt_count < max_attempts {
                        tokio::time::sleep(policy.delay_for_attempt(attempt.attempt_count - 1)).await;
                    }
                }
            }
        }

        warn!(attempts = attempt.attempt_count, error = %last_error, "webhook delivery abandoned");
        DeliveryReport {
            target_url: attempt.target_url,
            attempts: attempt.attempt_count,
            outcome: DeliveryOutcome::Abandoned { last_error },
        }
    }

    /// Exactly one POST with the probe timeout; never retried.
    pub async fn probe(&self, url: &str, payload: &WebhookPayload) -> ProbeResult {
        let started = Instant::now();
        let result = self.post_once(url, payload, self.config.probe_timeout).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (outcome, status_code, message) = match result {
            Ok(status) => (
                ProbeOutcome::Delivered,
                Some(status.as_u16()),
                format!("Webhook responded with {}", status.as_u16()),
            ),
            Err(DeliveryError::HttpStatus { status, .. }) => (
                ProbeOutcome::HttpError,
                Some(status),
                format!("Webhook responded with {status}"),
            ),
            Err(DeliveryError::Request(err)) if err.is_timeout() => (
                ProbeOutcome::Timeout,
                None,
                format!("Request timed out after {}s", self.config.probe_timeout.as_secs_f32()),
            ),
            Err(DeliveryError::Request(err)) if err.is_connect() => {
                (ProbeOutcome::ConnectionError, None, err.to_string())
            }
            Err(DeliveryError::Request(err)) if err.is_builder() => {
                (ProbeOutcome::InvalidRequest, None, err.to_string())
            }
            Err(DeliveryError::Request(err)) => (ProbeOutcome::ConnectionError, None, err.to_string()),
        };

        ProbeResult {
            url: url.to_string(),
            success: outcome == ProbeOutcome::Delivered,
            outcome,
            status_code,
            latency_ms,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prodimp_core::IMPORT_COMPLETED_EVENT;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_client(max_attempts: u32) -> WebhookClient {
        WebhookClient::new(WebhookClientConfig {
            timeout: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(200),
            user_agent: Some("prodimp-test".into()),
            backoff: BackoffPolicy {
                max_attempts,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
        })
        .expect("client")
    }

    fn payload() -> WebhookPayload {
        WebhookPayload::new(IMPORT_COMPLETED_EVENT, json!({"total_processed": 3}), Utc::now())
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn delivers_json_payload_on_first_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(json!({"event": "import.completed", "data": {"total_processed": 3}})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let report = fast_client(5)
            .deliver(DeliveryAttempt::new(format!("{}/hook", server.uri()), payload()))
            .await;

        assert_eq!(report.attempts, 1);
        assert_eq!(report.outcome, DeliveryOutcome::Delivered { status: 204 });
    }

    #[tokio::test]
    async fn non_success_status_is_retried_until_attempts_run_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .expect(5)
            .mount(&server)
            .await;

        let report = fast_client(5)
            .deliver(DeliveryAttempt::new(server.uri(), payload()))
            .await;

        assert_eq!(report.attempts, 5);
        assert!(!report.delivered());
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let report = fast_client(5)
            .deliver(DeliveryAttempt::new(server.uri(), payload()))
            .await;

        assert_eq!(report.attempts, 3);
        assert!(report.delivered());
    }

    #[tokio::test]
    async fn malformed_url_is_not_retried() {
        let report = fast_client(5)
            .deliver(DeliveryAttempt::new("not a url", payload()))
            .await;
        assert_eq!(report.attempts, 1);
        assert!(matches!(report.outcome, DeliveryOutcome::Abandoned { .. }));
    }

    #[tokio::test]
    async fn probe_reports_status_and_latency() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let result = fast_client(5).probe(&server.uri(), &payload()).await;

        assert!(!result.success);
        assert_eq!(result.outcome, ProbeOutcome::HttpError);
        assert_eq!(result.status_code, Some(500));
    }

    #[tokio::test]
    async fn probe_classifies_timeouts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let result = fast_client(5).probe(&server.uri(), &payload()).await;

        assert_eq!(result.outcome, ProbeOutcome::Timeout);
        assert_eq!(result.status_code, None);
        assert!(result.latency_ms < 2000);
    }
}
