//! Cloud Resource Manager lookups.

use async_trait::async_trait;
use serde_json::Value;

use super::{CollaboratorError, GcpCredentials, ProjectDirectory};

pub const DEFAULT_RESOURCE_MANAGER_URL: &str = "https://cloudresourcemanager.googleapis.com";

/// Resolves project numbers and organizations through the v1 REST API.
pub struct ResourceManagerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ResourceManagerClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: DEFAULT_RESOURCE_MANAGER_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, String> {
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("status={status}: {body}"));
        }
        response.json().await.map_err(|e| e.to_string())
    }
}

/// Pull `projectNumber` out of a `projects.get` response.
pub fn parse_project_number(body: &Value) -> Option<String> {
    match body.get("projectNumber")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First `organization` ancestor in a `projects.getAncestry` response.
pub fn parse_ancestry_organization(body: &Value) -> Option<String> {
    body.get("ancestor")?
        .as_array()?
        .iter()
        .filter_map(|a| a.get("resourceId"))
        .find(|r| r.get("type").and_then(Value::as_str) == Some("organization"))
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl ProjectDirectory for ResourceManagerClient {
    async fn project_number(&self, creds: &GcpCredentials) -> Result<String, CollaboratorError> {
        let url = format!("{}/v1/projects/{}", self.base_url, creds.project_id);
        let body = self
            .send(self.client.get(&url).bearer_auth(&creds.access_token))
            .await
            .map_err(CollaboratorError::ProjectNumber)?;

        parse_project_number(&body).ok_or_else(|| {
            CollaboratorError::ProjectNumber(format!("project {} not found", creds.project_id))
        })
    }

    async fn organization_id(&self, creds: &GcpCredentials) -> Result<String, CollaboratorError> {
        let url = format!("{}/v1/projects/{}:getAncestry", self.base_url, creds.project_id);
        let body = self
            .send(
                self.client
                    .post(&url)
                    .bearer_auth(&creds.access_token)
                    .json(&serde_json::json!({})),
            )
            .await
            .map_err(CollaboratorError::Organization)?;

        parse_ancestry_organization(&body).ok_or_else(|| {
            CollaboratorError::Organization(format!(
                "project {} has no organization ancestor",
                creds.project_id
            ))
        })
    }
}
