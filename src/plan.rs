//! Terraform plan retrieval.
//!
//! The plan is fetched from the run's `plan_json_api_url` using the run
//! task's access token and passed on byte-for-byte.

use async_trait::async_trait;
use thiserror::Error;
use tracing::error;

/// Plan download failure with the status to report to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to fetch plan file: {message}")]
pub struct PlanFetchError {
    pub status: u16,
    pub message: String,
}

#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn fetch_plan(&self, url: &str, access_token: &str) -> Result<Vec<u8>, PlanFetchError>;
}

/// Fetches plans over HTTP with bearer authentication.
pub struct HttpPlanSource {
    client: reqwest::Client,
}

impl HttpPlanSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlanSource for HttpPlanSource {
    async fn fetch_plan(&self, url: &str, access_token: &str) -> Result<Vec<u8>, PlanFetchError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| {
                error!(target: "validation", "Error fetching Terraform plan: {}", e);
                PlanFetchError {
                    status: e.status().map(|s| s.as_u16()).unwrap_or(500),
                    message: e.to_string(),
                }
            })?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(PlanFetchError {
                status: status.as_u16(),
                message: format!("plan endpoint returned {}", status),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| PlanFetchError {
                status: 500,
                message: e.to_string(),
            })
    }
}
