//! Retry policy for calls to the validation API.
//!
//! Only responses with a status in the retryable set are retried, with a
//! fixed escalating delay between attempts. Everything else, including
//! network failures that never produced a status, is final.

use std::future::Future;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Method;
use tracing::{error, warn};

use super::ValidationError;

/// Status codes worth another attempt.
pub const DEFAULT_RETRYABLE_STATUS_CODES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Delays before the 2nd, 3rd and 4th attempt.
pub const DEFAULT_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retryable_status_codes: Vec<u16>,
    /// One entry per retry; `delays.len() + 1` attempts in total.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
            delays: DEFAULT_RETRY_DELAYS.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Delay to wait after the failed attempt `attempt` (0-based), or `None`
    /// when no attempt is left.
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }
}

/// Result of a single attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// Retryable failure with the status that caused it.
    Retry { status: u16, message: String },
    Fail(ValidationError),
}

/// Drive `op` until it succeeds, fails for good, or the policy runs out.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    context: &'static str,
    mut op: F,
) -> Result<T, ValidationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut attempt = 0;
    loop {
        let (status, message) = match op().await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(err) => {
                error!(target: "validation", "{}", err);
                return Err(err);
            }
            Attempt::Retry { status, message } => (status, message),
        };

        match policy.delay_after(attempt) {
            Some(delay) => {
                warn!(
                    target: "validation",
                    "Retryable error ({}) calling {}. Retrying in {} seconds...",
                    status,
                    context,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                let err = ValidationError::RetriesExhausted {
                    context,
                    attempts: attempt + 1,
                    last_status: status,
                };
                error!(target: "validation", "{} Last error: {}", err, message);
                return Err(err);
            }
        }
    }
}

/// An outbound request that can be replayed.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// HTTP client that applies a [`RetryPolicy`] to every call.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `request`, returning the first successful response.
    pub async fn execute(
        &self,
        context: &'static str,
        request: &OutboundRequest,
    ) -> Result<reqwest::Response, ValidationError> {
        run_with_retry(&self.policy, context, || self.attempt(context, request)).await
    }

    async fn attempt(
        &self,
        context: &'static str,
        request: &OutboundRequest,
    ) -> Attempt<reqwest::Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                return match e.status() {
                    Some(status) => self.classify(context, status.as_u16(), e.to_string()),
                    None => Attempt::Fail(ValidationError::Transport {
                        context,
                        message: e.to_string(),
                    }),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            return Attempt::Done(response);
        }
        let body = response.text().await.unwrap_or_default();
        self.classify(context, status.as_u16(), body)
    }

    fn classify<T>(&self, context: &'static str, status: u16, message: String) -> Attempt<T> {
        if self.policy.is_retryable(status) {
            Attempt::Retry { status, message }
        } else {
            Attempt::Fail(ValidationError::Remote {
                context,
                status,
                message,
            })
        }
    }
}
