//! HMAC key retrieval.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;

use super::{CollaboratorError, GcpCredentials, SecretStore};

pub const DEFAULT_SECRET_MANAGER_URL: &str = "https://secretmanager.googleapis.com";

/// Reads `projects/{number}/secrets/{name}/versions/latest` from Secret Manager.
pub struct SecretManagerStore {
    client: reqwest::Client,
    base_url: String,
    secret_name: String,
}

impl SecretManagerStore {
    pub fn new(client: reqwest::Client, secret_name: impl Into<String>) -> Self {
        Self {
            client,
            base_url: DEFAULT_SECRET_MANAGER_URL.to_string(),
            secret_name: secret_name.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Resource name of the latest version of a secret.
pub fn secret_version_name(project_number: &str, secret_name: &str) -> String {
    format!(
        "projects/{}/secrets/{}/versions/latest",
        project_number, secret_name
    )
}

/// Decode the base64 `payload.data` of an `access` response.
pub fn decode_secret_payload(body: &Value) -> Result<String, String> {
    let data = body
        .get("payload")
        .and_then(|p| p.get("data"))
        .and_then(Value::as_str)
        .ok_or_else(|| "secret payload missing".to_string())?;
    let bytes = BASE64
        .decode(data)
        .map_err(|e| format!("secret payload is not base64: {e}"))?;
    String::from_utf8(bytes).map_err(|_| "secret payload is not UTF-8".to_string())
}

#[async_trait]
impl SecretStore for SecretManagerStore {
    async fn hmac_key(
        &self,
        project_number: &str,
        creds: &GcpCredentials,
    ) -> Result<String, CollaboratorError> {
        let url = format!(
            "{}/v1/{}:access",
            self.base_url,
            secret_version_name(project_number, &self.secret_name)
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&creds.access_token)
            .send()
            .await
            .map_err(|e| CollaboratorError::Secret(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CollaboratorError::Secret(format!(
                "access {} failed (status={})",
                self.secret_name,
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Secret(e.to_string()))?;
        decode_secret_payload(&body).map_err(CollaboratorError::Secret)
    }
}

/// Fixed key, for local development and tests.
pub struct StaticSecretStore {
    key: String,
}

impl StaticSecretStore {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn hmac_key(&self, _: &str, _: &GcpCredentials) -> Result<String, CollaboratorError> {
        Ok(self.key.clone())
    }
}
