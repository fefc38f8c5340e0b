//! Run-task result delivery.
//!
//! Task results go back to Terraform as a JSON:API PATCH against the
//! run's `task_result_callback_url`. Delivery is attempted once; the caller
//! decides what a non-200 status means.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, error};

use crate::validation::TaskResultDocument;

pub const CALLBACK_CONTENT_TYPE: &str = "application/vnd.api+json";

/// Status reported when the request never produced an HTTP response.
pub const TRANSPORT_FAILURE_STATUS: u16 = 500;

/// Destination for interim and final task results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver `document` and return the receiver's HTTP status.
    async fn deliver(&self, document: &TaskResultDocument) -> u16;
}

/// Delivers task results to a single run's callback URL.
pub struct CallbackDispatcher {
    client: reqwest::Client,
    url: String,
    access_token: String,
}

impl CallbackDispatcher {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            access_token: access_token.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("url", &self.url)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl ResultSink for CallbackDispatcher {
    async fn deliver(&self, document: &TaskResultDocument) -> u16 {
        let result = self
            .client
            .patch(&self.url)
            .header(CONTENT_TYPE, CALLBACK_CONTENT_TYPE)
            .bearer_auth(&self.access_token)
            .json(&document.callback_body())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(target: "callback", status, "task result delivered");
                status
            }
            Err(e) => {
                error!(target: "callback", "Error sending callback request: {}", e);
                e.status()
                    .map(|s| s.as_u16())
                    .unwrap_or(TRANSPORT_FAILURE_STATUS)
            }
        }
    }
}
